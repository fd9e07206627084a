//! CONNECT tunnel negotiation through an HTTP proxy.

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::address::{Challenge, Proxy, ProxyAuthenticator};
use crate::error::ConnectError;

/// Hard bound on CONNECT attempts for one route, counting authentication
/// round trips.
pub(crate) const MAX_TUNNEL_ATTEMPTS: usize = 21;

const MAX_RESPONSE_BYTES: usize = 16 * 1024;

/// Outcome of one CONNECT round trip.
#[derive(Debug)]
pub(crate) enum TunnelOutcome {
    /// The proxy opened the tunnel; the stream now carries the origin's
    /// bytes.
    Established,
    /// The proxy demanded credentials. Retry with this authorization,
    /// reconnecting the TCP leg first when the proxy closed this one.
    Retry {
        authorization: String,
        reconnect: bool,
    },
}

/// Send one CONNECT request and interpret the response.
pub(crate) async fn negotiate<S>(
    stream: &mut S,
    target_host: &str,
    target_port: u16,
    proxy: &Proxy,
    authenticator: &dyn ProxyAuthenticator,
    authorization: Option<&str>,
) -> Result<TunnelOutcome, ConnectError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut request = format!(
        "CONNECT {target_host}:{target_port} HTTP/1.1\r\n\
         Host: {target_host}:{target_port}\r\n\
         Proxy-Connection: Keep-Alive\r\n"
    );
    if let Some(authorization) = authorization {
        request.push_str("Proxy-Authorization: ");
        request.push_str(authorization);
        request.push_str("\r\n");
    }
    request.push_str("\r\n");

    stream
        .write_all(request.as_bytes())
        .await
        .map_err(|error| ConnectError::Tunnel(format!("failed to send CONNECT: {error}")))?;
    stream
        .flush()
        .await
        .map_err(|error| ConnectError::Tunnel(format!("failed to send CONNECT: {error}")))?;

    let (head, leftover) = read_response_head(stream).await?;
    let response = Response::parse(&head)?;

    match response.code {
        200 => {
            // TLS is negotiated directly on this stream next; bytes the
            // proxy sent beyond the response head would corrupt it.
            if leftover != 0 {
                return Err(ConnectError::Tunnel(
                    "proxy buffered unexpected bytes after CONNECT response".into(),
                ));
            }
            Ok(TunnelOutcome::Established)
        }
        407 => {
            let challenge = response.challenge.ok_or_else(|| {
                ConnectError::Tunnel("407 response without a proxy challenge".into())
            })?;
            let Some(authorization) = authenticator.authenticate(proxy, &challenge) else {
                return Err(ConnectError::Tunnel("proxy authentication required".into()));
            };
            Ok(TunnelOutcome::Retry {
                authorization,
                reconnect: response.close,
            })
        }
        code => Err(ConnectError::Tunnel(format!(
            "unexpected response code {code} from proxy"
        ))),
    }
}

async fn read_response_head<S>(stream: &mut S) -> Result<(String, usize), ConnectError>
where
    S: AsyncRead + Unpin,
{
    let mut buffer = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];
    loop {
        let n = stream
            .read(&mut chunk)
            .await
            .map_err(|error| ConnectError::Tunnel(format!("failed to read CONNECT response: {error}")))?;
        if n == 0 {
            return Err(ConnectError::Tunnel(
                "proxy closed the connection before responding".into(),
            ));
        }
        buffer.extend_from_slice(&chunk[..n]);
        if let Some(end) = find_head_end(&buffer) {
            let leftover = buffer.len() - end;
            let head = String::from_utf8_lossy(&buffer[..end]).into_owned();
            return Ok((head, leftover));
        }
        if buffer.len() > MAX_RESPONSE_BYTES {
            return Err(ConnectError::Tunnel("CONNECT response too large".into()));
        }
    }
}

fn find_head_end(buffer: &[u8]) -> Option<usize> {
    buffer
        .windows(4)
        .position(|w| w == b"\r\n\r\n")
        .map(|i| i + 4)
}

#[derive(Debug)]
struct Response {
    code: u16,
    close: bool,
    challenge: Option<Challenge>,
}

impl Response {
    fn parse(head: &str) -> Result<Self, ConnectError> {
        let mut lines = head.split("\r\n");
        let status = lines
            .next()
            .ok_or_else(|| ConnectError::Tunnel("empty CONNECT response".into()))?;
        let code = status
            .split_whitespace()
            .nth(1)
            .and_then(|c| c.parse::<u16>().ok())
            .ok_or_else(|| {
                ConnectError::Tunnel(format!("malformed status line {status:?}"))
            })?;

        let mut close = false;
        let mut challenge = None;
        for line in lines {
            let Some((name, value)) = line.split_once(':') else {
                continue;
            };
            let name = name.trim();
            let value = value.trim();
            if name.eq_ignore_ascii_case("connection") && value.eq_ignore_ascii_case("close") {
                close = true;
            } else if name.eq_ignore_ascii_case("proxy-authenticate") {
                challenge = Some(parse_challenge(value));
            }
        }
        Ok(Response {
            code,
            close,
            challenge,
        })
    }
}

fn parse_challenge(value: &str) -> Challenge {
    let mut parts = value.splitn(2, ' ');
    let scheme = parts.next().unwrap_or("").to_owned();
    let realm = parts.next().and_then(|params| {
        params.split(',').find_map(|param| {
            let (name, value) = param.split_once('=')?;
            name.trim()
                .eq_ignore_ascii_case("realm")
                .then(|| value.trim().trim_matches('"').to_owned())
        })
    });
    Challenge { scheme, realm }
}
