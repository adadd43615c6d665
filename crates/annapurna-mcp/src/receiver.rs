//! Authorization code receivers.
//!
//! The negotiator does not care how the credential owner's authorization
//! code makes it back into the process. [`StdinCodeReceiver`] prints the URL
//! and reads the code from the terminal; [`LoopbackCodeReceiver`] listens on
//! the redirect URL and captures it from the browser redirect.

use crate::error::{AnnapurnaError, AnnapurnaResult};
use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Write as _;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Mutex;
use tracing::{debug, error, info, warn};

/// How long the loopback receiver waits for the browser redirect.
pub const DEFAULT_CALLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

/// How long one callback connection may take to send its request line.
pub const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Delivers the authorization code for one authorization attempt.
#[async_trait]
pub trait AuthorizationCodeReceiver: Send + Sync {
    /// Present `authorization_url` to the credential owner and return the
    /// code issued for `expected_state`.
    async fn receive(&self, authorization_url: &str, expected_state: &str)
        -> AnnapurnaResult<String>;
}

/// Prints the authorization URL and reads the code from standard input.
#[derive(Debug, Default)]
pub struct StdinCodeReceiver;

#[async_trait]
impl AuthorizationCodeReceiver for StdinCodeReceiver {
    async fn receive(
        &self,
        authorization_url: &str,
        expected_state: &str,
    ) -> AnnapurnaResult<String> {
        println!("Please visit {authorization_url} to authorize the application and get the authorization code.");
        print!("Enter the authorization code: ");
        std::io::stdout().flush()?;

        let mut line = String::new();
        let read = BufReader::new(tokio::io::stdin())
            .read_line(&mut line)
            .await?;
        if read == 0 {
            return Err(AnnapurnaError::authorization(
                "Standard input closed before an authorization code was entered",
            ));
        }

        parse_code_input(&line, expected_state)
    }
}

/// Extract the code from what the user typed.
///
/// Accepts a bare code or the whole redirect URL. A pasted URL must carry the
/// expected state when it carries one at all.
pub fn parse_code_input(input: &str, expected_state: &str) -> AnnapurnaResult<String> {
    let input = input.trim();
    if input.is_empty() {
        return Err(AnnapurnaError::authorization("No authorization code entered"));
    }

    let Ok(url) = url::Url::parse(input) else {
        return Ok(input.to_string());
    };
    if url.query().is_none() {
        return Ok(input.to_string());
    }

    let params: HashMap<String, String> = url.query_pairs().into_owned().collect();

    if let Some(err) = params.get("error") {
        let message = params.get("error_description").unwrap_or(err);
        return Err(AnnapurnaError::authorization(message.clone()));
    }
    if let Some(state) = params.get("state") {
        if state != expected_state {
            return Err(AnnapurnaError::authorization(
                "State mismatch in redirect URL - potential CSRF attack",
            ));
        }
    }

    params
        .get("code")
        .cloned()
        .ok_or_else(|| AnnapurnaError::authorization("Redirect URL carries no code"))
}

/// Captures the browser redirect on the loopback redirect URL.
pub struct LoopbackCodeReceiver {
    listener: Mutex<Option<TcpListener>>,
    local_addr: SocketAddr,
    callback_path: String,
    timeout: Duration,
    connection_timeout: Duration,
}

impl LoopbackCodeReceiver {
    /// Bind the host and port of `redirect_url`.
    pub async fn bind(redirect_url: &str) -> AnnapurnaResult<Self> {
        let url = url::Url::parse(redirect_url)?;
        let host = url
            .host_str()
            .ok_or_else(|| AnnapurnaError::config("Redirect URL has no host"))?
            .to_string();
        let port = url
            .port_or_known_default()
            .ok_or_else(|| AnnapurnaError::config("Redirect URL has no port"))?;

        let listener = TcpListener::bind((host.as_str(), port)).await.map_err(|e| {
            AnnapurnaError::transport(format!("Failed to bind OAuth callback listener: {e}"))
        })?;
        let local_addr = listener.local_addr()?;

        info!(address = %local_addr, "OAuth callback listener started");

        Ok(Self {
            listener: Mutex::new(Some(listener)),
            local_addr,
            callback_path: url.path().to_string(),
            timeout: DEFAULT_CALLBACK_TIMEOUT,
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
        })
    }

    /// Override how long to wait for the redirect.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Override how long a single connection may stay silent.
    pub fn with_connection_timeout(mut self, timeout: Duration) -> Self {
        self.connection_timeout = timeout;
        self
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    async fn accept_until_done(
        &self,
        listener: &TcpListener,
        expected_state: &str,
    ) -> AnnapurnaResult<String> {
        loop {
            let (stream, peer) = listener.accept().await?;
            debug!(peer = %peer, "OAuth callback connection");
            let handled = tokio::time::timeout(
                self.connection_timeout,
                handle_connection(stream, &self.callback_path, expected_state),
            )
            .await;
            match handled {
                Ok(Ok(Some(Ok(code)))) => return Ok(code),
                Ok(Ok(Some(Err(message)))) => return Err(AnnapurnaError::authorization(message)),
                Ok(Ok(None)) => continue,
                Ok(Err(e)) => warn!(error = %e, "Error handling OAuth callback"),
                Err(_) => warn!(peer = %peer, "OAuth callback connection timed out"),
            }
        }
    }
}

#[async_trait]
impl AuthorizationCodeReceiver for LoopbackCodeReceiver {
    async fn receive(
        &self,
        authorization_url: &str,
        expected_state: &str,
    ) -> AnnapurnaResult<String> {
        let listener = self.listener.lock().await.take().ok_or_else(|| {
            AnnapurnaError::authorization("OAuth callback listener already used")
        })?;

        println!("Please visit {authorization_url} to authorize the application.");
        println!("Waiting for the redirect on http://{}{} ...", self.local_addr, self.callback_path);

        match tokio::time::timeout(self.timeout, self.accept_until_done(&listener, expected_state))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(AnnapurnaError::authorization(
                "OAuth callback timeout - authorization took too long",
            )),
        }
    }
}

/// HTML response for successful authorization.
const HTML_SUCCESS: &str = r#"<!DOCTYPE html>
<html>
<head><title>Annapurna - Authorization Successful</title></head>
<body>
  <h1>Authorization Successful</h1>
  <p>You can close this window and return to the terminal.</p>
</body>
</html>"#;

/// HTML response for failed authorization.
fn html_error(error: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head><title>Annapurna - Authorization Failed</title></head>
<body>
  <h1>Authorization Failed</h1>
  <pre>{}</pre>
</body>
</html>"#,
        html_escape(error)
    )
}

/// Escape HTML special characters.
fn html_escape(s: &str) -> String {
    s.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
        .replace('\'', "&#39;")
}

/// Handle one connection to the callback listener.
///
/// Returns `Some` once the authorization attempt is decided, `None` for
/// requests that do not belong to it (favicon, wrong state).
async fn handle_connection(
    mut stream: TcpStream,
    callback_path: &str,
    expected_state: &str,
) -> AnnapurnaResult<Option<Result<String, String>>> {
    let mut buffer = [0u8; 4096];
    let n = stream.read(&mut buffer).await?;
    let request = String::from_utf8_lossy(&buffer[..n]);

    let first_line = request.lines().next().unwrap_or("");
    let parts: Vec<&str> = first_line.split_whitespace().collect();
    if parts.len() < 2 {
        write_response(&mut stream, 400, "text/plain", "Bad Request").await;
        return Ok(None);
    }

    let parsed = match url::Url::parse(&format!("http://127.0.0.1{}", parts[1])) {
        Ok(u) => u,
        Err(_) => {
            write_response(&mut stream, 400, "text/plain", "Invalid URL").await;
            return Ok(None);
        }
    };

    if parsed.path() != callback_path {
        write_response(&mut stream, 404, "text/plain", "Not Found").await;
        return Ok(None);
    }

    let params: HashMap<String, String> = parsed.query_pairs().into_owned().collect();

    if params.get("state").map(String::as_str) != Some(expected_state) {
        error!("OAuth callback with missing or invalid state");
        let html = html_error("Invalid or missing state parameter - potential CSRF attack");
        write_response(&mut stream, 400, "text/html", &html).await;
        return Ok(None);
    }

    if let Some(err) = params.get("error") {
        let message = params
            .get("error_description")
            .cloned()
            .unwrap_or_else(|| err.clone());
        write_response(&mut stream, 200, "text/html", &html_error(&message)).await;
        return Ok(Some(Err(message)));
    }

    match params.get("code") {
        Some(code) => {
            write_response(&mut stream, 200, "text/html", HTML_SUCCESS).await;
            Ok(Some(Ok(code.clone())))
        }
        None => {
            let html = html_error("No authorization code provided");
            write_response(&mut stream, 400, "text/html", &html).await;
            Ok(Some(Err("No authorization code provided".to_string())))
        }
    }
}

async fn write_response(stream: &mut TcpStream, status: u16, content_type: &str, body: &str) {
    let response = http_response(status, content_type, body);
    stream.write_all(response.as_bytes()).await.ok();
}

/// Build an HTTP response.
fn http_response(status: u16, content_type: &str, body: &str) -> String {
    let status_text = match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        _ => "Unknown",
    };

    format!(
        "HTTP/1.1 {} {}\r\nContent-Type: {}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{}",
        status,
        status_text,
        content_type,
        body.len(),
        body
    )
}
