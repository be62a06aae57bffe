//! Windows Remote Management (WinRM) connection module
//!
//! WinRM is Microsoft's implementation of WS-Management, a SOAP-based protocol
//! for managing remote hosts. Every [`WinRmConnection::run`] call is a
//! self-contained exchange against the `/wsman` endpoint:
//!
//! 1. create a `cmd` shell
//! 2. start the command in it
//! 3. poll `Receive` until the command state is `Done`
//! 4. signal terminate and delete the shell
//!
//! No state survives between calls, so [`Connection::close`] has nothing to
//! release.
//!
//! # Authentication
//!
//! - **NTLM** (default): every request is preceded by an NTLMv2 handshake
//!   over `Authorization: Negotiate`. Messages are not sealed, so plain HTTP
//!   needs `AllowUnencrypted` on the host.
//! - **Basic**: username and password on every request.
//! - **Kerberos**: a [`KerberosTransport`] attaches a token obtained from a
//!   caller-supplied [`KerberosTokenSource`] for the service principal
//!   `HTTP/<host>@<REALM>`. Ticket acquisition is left to the source.
//!
//! # Example
//!
//! ```rust,ignore
//! use psremote::connection::{Connection, WinRmConfig, WinRmConnection};
//!
//! let conn = WinRmConnection::new(WinRmConfig::new("win01", "admin", "secret"))?;
//! let result = conn.run_with_powershell(&cancel, "Get-Service | ConvertTo-Json").await?;
//! println!("Output: {}", result.stdout);
//! ```

use async_trait::async_trait;
use base64::{engine::general_purpose::STANDARD as BASE64_STANDARD, Engine};
use quick_xml::events::{BytesStart, Event};
use quick_xml::Reader;
use reqwest::header::{HeaderMap, AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};
use url::Url;
use uuid::Uuid;

use super::config::{ResolvedWinRm, WinRmAuthMethod, WinRmConfig};
use super::ntlm::NtlmAuthenticator;
use super::{CmdResult, Connection, ConnectionError, ConnectionResult};

// ============================================================================
// Constants
// ============================================================================

const SOAP_ENV_NS: &str = "http://www.w3.org/2003/05/soap-envelope";
const WSA_NS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing";
const WSMAN_NS: &str = "http://schemas.dmtf.org/wbem/wsman/1/wsman.xsd";
const SHELL_NS: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell";

const SHELL_RESOURCE_URI: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/cmd";
const ANONYMOUS_ADDRESS: &str = "http://schemas.xmlsoap.org/ws/2004/08/addressing/role/anonymous";

const ACTION_CREATE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Create";
const ACTION_DELETE: &str = "http://schemas.xmlsoap.org/ws/2004/09/transfer/Delete";
const ACTION_COMMAND: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Command";
const ACTION_RECEIVE: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Receive";
const ACTION_SIGNAL: &str = "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/Signal";
const SIGNAL_TERMINATE: &str =
    "http://schemas.microsoft.com/wbem/wsman/1/windows/shell/signal/terminate";

const SOAP_CONTENT_TYPE: &str = "application/soap+xml;charset=UTF-8";
const MAX_ENVELOPE_SIZE: u32 = 153_600;

/// UTF-8 console code page for the remote shell
const CODEPAGE_UTF8: u32 = 65001;

/// Upper bound on how long one `Receive` may long-poll on the server
const MAX_OPERATION_TIMEOUT_SECS: u64 = 20;

/// `ERROR_WSMAN_OPERATION_TIMEDOUT`, returned when a `Receive` poll expires
/// with no output. The command is still running.
const WSMAN_OPERATION_TIMEOUT_CODE: &str = "2150858793";

// ============================================================================
// Kerberos
// ============================================================================

/// What a [`KerberosTokenSource`] is asked to produce a token for
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KerberosRequest {
    /// Service principal, `HTTP/<host>@<REALM>`
    pub spn: String,
    pub realm: String,
    pub krb5_config: Option<PathBuf>,
}

/// Produces Kerberos (GSS-API) tokens for WinRM requests.
///
/// Implementations typically wrap a GSS-API binding or a ticket cache.
#[async_trait]
pub trait KerberosTokenSource: Send + Sync {
    /// Returns the raw token bytes for one request.
    async fn token(&self, request: &KerberosRequest) -> ConnectionResult<Vec<u8>>;
}

/// Request decorator that authenticates with Kerberos instead of Basic
#[derive(Clone)]
pub struct KerberosTransport {
    realm: String,
    host: String,
    port: u16,
    protocol: String,
    krb5_config: Option<PathBuf>,
    source: Arc<dyn KerberosTokenSource>,
}

impl KerberosTransport {
    /// Service principal the token is requested for
    pub fn spn(&self) -> String {
        format!("HTTP/{}@{}", self.host, self.realm.to_uppercase())
    }

    /// Endpoint using the Kerberos protocol scheme
    pub fn endpoint_url(&self) -> String {
        format!("{}://{}:{}/wsman", self.protocol, self.host, self.port)
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    fn request(&self) -> KerberosRequest {
        KerberosRequest {
            spn: self.spn(),
            realm: self.realm.clone(),
            krb5_config: self.krb5_config.clone(),
        }
    }

    async fn authorize(&self, request: RequestBuilder) -> ConnectionResult<RequestBuilder> {
        let token = self.source.token(&self.request()).await?;
        Ok(request.header(
            AUTHORIZATION,
            format!("Kerberos {}", BASE64_STANDARD.encode(token)),
        ))
    }
}

impl fmt::Debug for KerberosTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KerberosTransport")
            .field("realm", &self.realm)
            .field("host", &self.host)
            .field("port", &self.port)
            .field("protocol", &self.protocol)
            .field("krb5_config", &self.krb5_config)
            .finish()
    }
}

#[derive(Debug)]
enum Auth {
    Basic { username: String, password: String },
    Ntlm(NtlmAuthenticator),
    Kerberos(KerberosTransport),
}

impl Auth {
    fn name(&self) -> &'static str {
        match self {
            Auth::Basic { .. } => "basic",
            Auth::Ntlm(_) => "ntlm",
            Auth::Kerberos(_) => "kerberos",
        }
    }
}

// ============================================================================
// WinRM Connection
// ============================================================================

/// WinRM connection for executing commands on Windows hosts
pub struct WinRmConnection {
    identifier: String,
    endpoint: Url,
    client: Client,
    auth: Auth,
    operation_timeout: Duration,
}

impl WinRmConnection {
    /// Builds a password-authenticated client, NTLM or Basic as configured.
    /// Performs no network I/O.
    ///
    /// A config carrying Kerberos settings is rejected here; use
    /// [`WinRmConnection::with_kerberos`] to supply a token source.
    pub fn new(config: WinRmConfig) -> ConnectionResult<Self> {
        let resolved = config.resolve()?;

        if let Some(kerberos) = &config.kerberos {
            kerberos.resolved_protocol()?;
            return Err(ConnectionError::InvalidConfig(
                "Kerberos authentication requires a token source".to_string(),
            ));
        }

        let endpoint = resolved.endpoint_url();
        let auth = match resolved.auth {
            WinRmAuthMethod::Ntlm => {
                Auth::Ntlm(NtlmAuthenticator::new(&resolved.username, &resolved.password))
            }
            WinRmAuthMethod::Basic => Auth::Basic {
                username: resolved.username.clone(),
                password: resolved.password.clone(),
            },
        };
        Self::build(&resolved, &endpoint, auth)
    }

    /// Builds a Kerberos-authenticated client. Performs no network I/O.
    pub fn with_kerberos(
        config: WinRmConfig,
        source: Arc<dyn KerberosTokenSource>,
    ) -> ConnectionResult<Self> {
        let resolved = config.resolve()?;
        let kerberos = config.kerberos.as_ref().ok_or_else(|| {
            ConnectionError::InvalidConfig("Kerberos settings are missing".to_string())
        })?;

        let transport = KerberosTransport {
            realm: kerberos.realm.clone(),
            host: resolved.host.clone(),
            port: resolved.port,
            protocol: kerberos.resolved_protocol()?.to_string(),
            krb5_config: kerberos.krb_config_file.clone(),
            source,
        };

        let endpoint = transport.endpoint_url();
        Self::build(&resolved, &endpoint, Auth::Kerberos(transport))
    }

    fn build(resolved: &ResolvedWinRm, endpoint: &str, auth: Auth) -> ConnectionResult<Self> {
        let endpoint = Url::parse(endpoint).map_err(|e| {
            ConnectionError::InvalidConfig(format!("Invalid WinRM endpoint {}: {}", endpoint, e))
        })?;

        let client = Client::builder()
            .timeout(resolved.timeout)
            .danger_accept_invalid_certs(resolved.insecure)
            .build()
            .map_err(|e| {
                ConnectionError::ConnectionFailed(format!("Failed to create HTTP client: {}", e))
            })?;

        // a Receive poll must expire on the server before the HTTP timeout fires
        let operation_secs = resolved
            .timeout
            .as_secs()
            .saturating_sub(10)
            .clamp(1, MAX_OPERATION_TIMEOUT_SECS);

        debug!(
            endpoint = %endpoint,
            user = %resolved.username,
            auth = auth.name(),
            "WinRM client ready"
        );

        Ok(Self {
            identifier: format!("{}@{}:{}", resolved.username, resolved.host, resolved.port),
            endpoint,
            client,
            auth,
            operation_timeout: Duration::from_secs(operation_secs),
        })
    }

    /// The `/wsman` URL requests are sent to
    pub fn endpoint(&self) -> &Url {
        &self.endpoint
    }

    /// Kerberos decorator, when Kerberos authentication is in use
    pub fn kerberos(&self) -> Option<&KerberosTransport> {
        match &self.auth {
            Auth::Kerberos(k) => Some(k),
            _ => None,
        }
    }

    /// Name of the authentication scheme in use
    pub fn auth_scheme(&self) -> &'static str {
        self.auth.name()
    }

    /// Render a SOAP envelope around `body`
    fn envelope(&self, action: &str, shell_id: Option<&str>, options: &str, body: &str) -> String {
        let selector = shell_id
            .map(|id| {
                format!(
                    r#"
    <w:SelectorSet>
      <w:Selector Name="ShellId">{}</w:Selector>
    </w:SelectorSet>"#,
                    xml_escape(id)
                )
            })
            .unwrap_or_default();

        format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="{SOAP_ENV_NS}" xmlns:a="{WSA_NS}" xmlns:w="{WSMAN_NS}" xmlns:rsp="{SHELL_NS}">
  <s:Header>
    <a:To>{}</a:To>
    <w:ResourceURI s:mustUnderstand="true">{SHELL_RESOURCE_URI}</w:ResourceURI>
    <a:ReplyTo>
      <a:Address s:mustUnderstand="true">{ANONYMOUS_ADDRESS}</a:Address>
    </a:ReplyTo>
    <a:Action s:mustUnderstand="true">{}</a:Action>
    <a:MessageID>uuid:{}</a:MessageID>
    <w:MaxEnvelopeSize s:mustUnderstand="true">{MAX_ENVELOPE_SIZE}</w:MaxEnvelopeSize>
    <w:OperationTimeout>PT{}S</w:OperationTimeout>{}{}
  </s:Header>
  {}
</s:Envelope>"#,
            xml_escape(self.endpoint.as_str()),
            action,
            Uuid::new_v4(),
            self.operation_timeout.as_secs(),
            selector,
            options,
            body
        )
    }

    /// POST one envelope and parse the reply
    async fn exchange(&self, envelope: String) -> ConnectionResult<Reply> {
        let response = match &self.auth {
            Auth::Basic { username, password } => {
                self.post()
                    .basic_auth(username, Some(password))
                    .body(envelope)
                    .send()
                    .await?
            }
            Auth::Ntlm(ntlm) => self.send_ntlm(ntlm, envelope).await?,
            Auth::Kerberos(kerberos) => {
                kerberos
                    .authorize(self.post().body(envelope))
                    .await?
                    .send()
                    .await?
            }
        };

        let status = response.status();
        let body = response.text().await?;

        if status == StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "{} rejected the credentials for {}",
                self.endpoint, self.identifier
            )));
        }

        let parsed = ResponseEnvelope::parse(&body);
        match parsed {
            Ok(doc) => match doc.fault {
                Some(fault) => Ok(Reply::Fault(fault)),
                None if status.is_success() => Ok(Reply::Ok(doc)),
                None => Err(ConnectionError::ConnectionFailed(format!(
                    "WinRM request failed with HTTP {}",
                    status
                ))),
            },
            Err(_) if !status.is_success() => Err(ConnectionError::ConnectionFailed(format!(
                "WinRM request failed with HTTP {}",
                status
            ))),
            Err(e) => Err(e),
        }
    }

    fn post(&self) -> RequestBuilder {
        self.client
            .post(self.endpoint.clone())
            .header(CONTENT_TYPE, SOAP_CONTENT_TYPE)
    }

    /// Negotiate, answer the challenge, and send `envelope` with the
    /// authenticate message.
    async fn send_ntlm(
        &self,
        ntlm: &NtlmAuthenticator,
        envelope: String,
    ) -> ConnectionResult<Response> {
        let negotiate = BASE64_STANDARD.encode(ntlm.negotiate_message());
        let response = self
            .post()
            .header(AUTHORIZATION, format!("Negotiate {}", negotiate))
            .send()
            .await?;

        let status = response.status();
        if status != StatusCode::UNAUTHORIZED {
            return Err(ConnectionError::AuthenticationFailed(format!(
                "{} answered the NTLM negotiate with HTTP {}",
                self.endpoint, status
            )));
        }
        let challenge = ntlm_challenge(response.headers())?;
        // the authenticate leg must reuse this connection
        let _ = response.bytes().await;

        trace!(challenge_len = challenge.len(), "Received NTLM challenge");
        let authenticate = BASE64_STANDARD.encode(ntlm.authenticate_message(&challenge)?);

        Ok(self
            .post()
            .header(AUTHORIZATION, format!("Negotiate {}", authenticate))
            .body(envelope)
            .send()
            .await?)
    }

    async fn call(&self, envelope: String) -> ConnectionResult<ResponseEnvelope> {
        match self.exchange(envelope).await? {
            Reply::Ok(doc) => Ok(doc),
            Reply::Fault(fault) => Err(ConnectionError::WinRmFault(fault.to_string())),
        }
    }

    /// Create a shell for command execution
    async fn create_shell(&self) -> ConnectionResult<String> {
        let options = format!(
            r#"
    <w:OptionSet xmlns:xsi="http://www.w3.org/2001/XMLSchema-instance">
      <w:Option Name="WINRS_NOPROFILE">FALSE</w:Option>
      <w:Option Name="WINRS_CODEPAGE">{CODEPAGE_UTF8}</w:Option>
    </w:OptionSet>"#
        );
        let body = r#"<s:Body>
    <rsp:Shell>
      <rsp:InputStreams>stdin</rsp:InputStreams>
      <rsp:OutputStreams>stdout stderr</rsp:OutputStreams>
    </rsp:Shell>
  </s:Body>"#;

        let doc = self
            .call(self.envelope(ACTION_CREATE, None, &options, body))
            .await?;
        let shell_id = doc
            .shell_id
            .ok_or_else(|| malformed("create response has no ShellId"))?;

        debug!(shell_id = %shell_id, "Created WinRM shell");
        Ok(shell_id)
    }

    /// Start a command in the shell
    async fn start_command(&self, shell_id: &str, command: &str) -> ConnectionResult<String> {
        let options = r#"
    <w:OptionSet>
      <w:Option Name="WINRS_CONSOLEMODE_STDIN">TRUE</w:Option>
      <w:Option Name="WINRS_SKIP_CMD_SHELL">FALSE</w:Option>
    </w:OptionSet>"#;
        let body = format!(
            r#"<s:Body>
    <rsp:CommandLine>
      <rsp:Command>{}</rsp:Command>
    </rsp:CommandLine>
  </s:Body>"#,
            xml_escape(command)
        );

        let doc = self
            .call(self.envelope(ACTION_COMMAND, Some(shell_id), options, &body))
            .await?;
        doc.command_id
            .ok_or_else(|| malformed("command response has no CommandId"))
    }

    /// Poll until the command reports `Done`
    async fn receive_output(&self, shell_id: &str, command_id: &str) -> ConnectionResult<CmdResult> {
        let body = format!(
            r#"<s:Body>
    <rsp:Receive>
      <rsp:DesiredStream CommandId="{}">stdout stderr</rsp:DesiredStream>
    </rsp:Receive>
  </s:Body>"#,
            xml_escape(command_id)
        );

        let mut stdout = Vec::new();
        let mut stderr = Vec::new();

        loop {
            let envelope = self.envelope(ACTION_RECEIVE, Some(shell_id), "", &body);
            let doc = match self.exchange(envelope).await? {
                Reply::Ok(doc) => doc,
                Reply::Fault(fault) if fault.is_operation_timeout() => {
                    trace!(command_id = %command_id, "Receive timed out, polling again");
                    continue;
                }
                Reply::Fault(fault) => return Err(ConnectionError::WinRmFault(fault.to_string())),
            };

            stdout.extend_from_slice(&doc.stdout);
            stderr.extend_from_slice(&doc.stderr);

            if doc.is_done() {
                let result = CmdResult {
                    stdout: String::from_utf8_lossy(&stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&stderr).into_owned(),
                    exit_code: doc.exit_code,
                };
                return Ok(result);
            }
        }
    }

    /// Signal command termination
    async fn signal_terminate(&self, shell_id: &str, command_id: &str) -> ConnectionResult<()> {
        let body = format!(
            r#"<s:Body>
    <rsp:Signal CommandId="{}">
      <rsp:Code>{SIGNAL_TERMINATE}</rsp:Code>
    </rsp:Signal>
  </s:Body>"#,
            xml_escape(command_id)
        );

        self.call(self.envelope(ACTION_SIGNAL, Some(shell_id), "", &body))
            .await
            .map(|_| ())
    }

    /// Delete shell
    async fn delete_shell(&self, shell_id: &str) -> ConnectionResult<()> {
        self.call(self.envelope(ACTION_DELETE, Some(shell_id), "", "<s:Body/>"))
            .await?;
        debug!(shell_id = %shell_id, "Deleted WinRM shell");
        Ok(())
    }

    async fn execute(&self, command: &str) -> ConnectionResult<CmdResult> {
        let shell_id = self.create_shell().await?;
        let result = self.execute_in_shell(&shell_id, command).await;

        if let Err(e) = self.delete_shell(&shell_id).await {
            warn!(shell_id = %shell_id, error = %e, "Failed to delete shell");
        }
        result
    }

    async fn execute_in_shell(&self, shell_id: &str, command: &str) -> ConnectionResult<CmdResult> {
        let command_id = self.start_command(shell_id, command).await?;
        let result = self.receive_output(shell_id, &command_id).await?;

        if let Err(e) = self.signal_terminate(shell_id, &command_id).await {
            debug!(command_id = %command_id, error = %e, "Failed to signal command termination");
        }
        Ok(result)
    }
}

impl fmt::Debug for WinRmConnection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WinRmConnection")
            .field("identifier", &self.identifier)
            .field("endpoint", &self.endpoint.as_str())
            .field("auth", &self.auth.name())
            .finish()
    }
}

#[async_trait]
impl Connection for WinRmConnection {
    fn identifier(&self) -> &str {
        &self.identifier
    }

    async fn run(&self, cancel: &CancellationToken, cmd: &str) -> ConnectionResult<CmdResult> {
        trace!(host = %self.identifier, command = %cmd, "Executing WinRM command");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                debug!(host = %self.identifier, "Command cancelled, abandoning WinRM exchange");
                Err(ConnectionError::Cancelled)
            }
            result = self.execute(cmd) => {
                let result = result.map_err(|e| ConnectionError::command(cmd, e))?;
                trace!(
                    exit_code = ?result.exit_code,
                    stdout_len = %result.stdout.len(),
                    stderr_len = %result.stderr.len(),
                    "WinRM command completed"
                );
                Ok(result)
            }
        }
    }

    async fn close(&self) -> ConnectionResult<()> {
        Ok(())
    }
}

// ============================================================================
// Response parsing
// ============================================================================

enum Reply {
    Ok(ResponseEnvelope),
    Fault(SoapFault),
}

/// A SOAP fault returned by the WinRM service
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SoapFault {
    /// `Code` attribute of the WS-Management fault detail
    pub code: Option<String>,
    /// SOAP subcode, e.g. `w:TimedOut`
    pub subcode: Option<String>,
    pub reason: String,
}

impl SoapFault {
    pub fn is_operation_timeout(&self) -> bool {
        self.code.as_deref() == Some(WSMAN_OPERATION_TIMEOUT_CODE)
            || self
                .subcode
                .as_deref()
                .is_some_and(|s| s.ends_with("TimedOut"))
    }
}

impl fmt::Display for SoapFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let reason = if self.reason.is_empty() {
            "unspecified fault"
        } else {
            &self.reason
        };
        match &self.code {
            Some(code) => write!(f, "{} (code {})", reason, code),
            None => f.write_str(reason),
        }
    }
}

/// Fields of interest from any WinRM response
#[derive(Debug, Default)]
struct ResponseEnvelope {
    shell_id: Option<String>,
    command_id: Option<String>,
    stdout: Vec<u8>,
    stderr: Vec<u8>,
    command_state: Option<String>,
    exit_code: Option<i32>,
    fault: Option<SoapFault>,
}

impl ResponseEnvelope {
    fn is_done(&self) -> bool {
        self.command_state
            .as_deref()
            .is_some_and(|s| s.ends_with("/Done"))
    }

    fn parse(xml: &str) -> ConnectionResult<Self> {
        let mut reader = Reader::from_str(xml);
        reader.config_mut().trim_text(true);

        let mut doc = Self::default();
        let mut path: Vec<String> = Vec::new();
        let mut stream: Option<String> = None;

        loop {
            match reader.read_event().map_err(xml_error)? {
                Event::Start(e) => {
                    let name = local_name(&e);
                    doc.open(&name, &e, &mut stream)?;
                    path.push(name);
                }
                Event::Empty(e) => {
                    let name = local_name(&e);
                    doc.open(&name, &e, &mut stream)?;
                }
                Event::End(_) => {
                    path.pop();
                }
                Event::Text(e) => {
                    let text = e.unescape().map_err(xml_error)?;
                    doc.text(&path, stream.as_deref(), text.trim())?;
                }
                Event::Eof => break,
                _ => {}
            }
        }

        Ok(doc)
    }

    /// Attribute-bearing elements
    fn open(
        &mut self,
        name: &str,
        e: &BytesStart<'_>,
        stream: &mut Option<String>,
    ) -> ConnectionResult<()> {
        match name {
            "Stream" => *stream = attribute(e, "Name")?,
            "CommandState" => self.command_state = attribute(e, "State")?,
            "Fault" => {
                self.fault.get_or_insert_with(SoapFault::default);
            }
            "WSManFault" => {
                if let Some(code) = attribute(e, "Code")? {
                    self.fault.get_or_insert_with(SoapFault::default).code = Some(code);
                }
            }
            _ => {}
        }
        Ok(())
    }

    fn text(&mut self, path: &[String], stream: Option<&str>, text: &str) -> ConnectionResult<()> {
        if text.is_empty() {
            return Ok(());
        }

        let current = path.last().map(String::as_str);
        let parent = path.len().checked_sub(2).map(|i| path[i].as_str());

        match (current, parent) {
            (Some("ShellId"), _) => self.shell_id = Some(text.to_string()),
            (Some("CommandId"), _) => self.command_id = Some(text.to_string()),
            (Some("Stream"), _) => {
                let bytes = BASE64_STANDARD
                    .decode(text)
                    .map_err(|e| malformed(format!("invalid stream content: {}", e)))?;
                match stream {
                    Some("stdout") => self.stdout.extend_from_slice(&bytes),
                    Some("stderr") => self.stderr.extend_from_slice(&bytes),
                    _ => {}
                }
            }
            (Some("ExitCode"), _) => {
                let code = text
                    .parse()
                    .map_err(|_| malformed(format!("invalid exit code {:?}", text)))?;
                self.exit_code = Some(code);
            }
            (Some("Text"), Some("Reason")) => {
                if let Some(fault) = self.fault.as_mut() {
                    fault.reason = text.to_string();
                }
            }
            (Some("Value"), Some("Subcode")) => {
                if let Some(fault) = self.fault.as_mut() {
                    fault.subcode = Some(text.to_string());
                }
            }
            (Some("Message"), Some("WSManFault")) => {
                if let Some(fault) = self.fault.as_mut() {
                    if fault.reason.is_empty() {
                        fault.reason = text.to_string();
                    }
                }
            }
            _ => {}
        }
        Ok(())
    }
}

/// The NTLM token from a `WWW-Authenticate: Negotiate <b64>` (or `NTLM`) challenge
fn ntlm_challenge(headers: &HeaderMap) -> ConnectionResult<Vec<u8>> {
    let token = headers
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(','))
        .find_map(|challenge| {
            let challenge = challenge.trim();
            challenge
                .strip_prefix("Negotiate ")
                .or_else(|| challenge.strip_prefix("NTLM "))
        })
        .ok_or_else(|| {
            ConnectionError::AuthenticationFailed(
                "Server did not offer an NTLM challenge".to_string(),
            )
        })?;

    BASE64_STANDARD.decode(token.trim()).map_err(|e| {
        ConnectionError::AuthenticationFailed(format!("Invalid NTLM challenge encoding: {}", e))
    })
}

fn local_name(e: &BytesStart<'_>) -> String {
    String::from_utf8_lossy(e.local_name().as_ref()).into_owned()
}

fn attribute(e: &BytesStart<'_>, name: &str) -> ConnectionResult<Option<String>> {
    for attr in e.attributes() {
        let attr = attr.map_err(|err| malformed(err))?;
        if attr.key.local_name().as_ref() == name.as_bytes() {
            let value = attr.unescape_value().map_err(xml_error)?;
            return Ok(Some(value.into_owned()));
        }
    }
    Ok(None)
}

fn xml_error(e: quick_xml::Error) -> ConnectionError {
    malformed(e.to_string())
}

fn malformed(detail: impl fmt::Display) -> ConnectionError {
    ConnectionError::ConnectionFailed(format!("Malformed WinRM response: {}", detail))
}

/// Escape special characters for XML
fn xml_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&apos;")
}

// ============================================================================
// Tests
// ============================================================================
