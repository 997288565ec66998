//! HTTP agent construction and bounded response helpers.
//!
//! The release feed and the artifact stream use separate agents: the feed
//! query is short and strict, the artifact stream tolerates slow links.

use std::io::{self, Read};
use std::time::Duration;

const WRITE_TIMEOUT: Duration = Duration::from_secs(30);
/// Redirect hops followed when redirects are enabled.
const MAX_REDIRECTS: u32 = 8;

/// Connect/read timeouts for one class of request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) struct Timeouts {
    pub connect: Duration,
    pub read: Duration,
}

/// Build an agent with the given timeouts.
///
/// With `follow_redirects` off, a 3xx response is returned to the caller
/// instead of being chased.
pub(crate) fn build_agent(timeouts: Timeouts, follow_redirects: bool) -> ureq::Agent {
    ureq::AgentBuilder::new()
        .timeout_connect(timeouts.connect)
        .timeout_read(timeouts.read)
        .timeout_write(WRITE_TIMEOUT)
        .redirects(if follow_redirects { MAX_REDIRECTS } else { 0 })
        .build()
}

/// Read a response into memory, enforcing a maximum byte size.
pub(crate) fn read_response_bytes(
    response: ureq::Response,
    max_bytes: usize,
) -> Result<Vec<u8>, io::Error> {
    if let Some(length) = content_length(&response)
        && length > max_bytes as u64
    {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response too large: {length} bytes"),
        ));
    }
    let mut limited = response.into_reader().take(max_bytes as u64 + 1);
    let mut bytes = Vec::new();
    limited.read_to_end(&mut bytes)?;
    if bytes.len() > max_bytes {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("Response exceeded {max_bytes} bytes"),
        ));
    }
    Ok(bytes)
}

/// Advertised body length, if the server sent a parseable `Content-Length`.
pub(crate) fn content_length(response: &ureq::Response) -> Option<u64> {
    response
        .header("Content-Length")
        .and_then(|value| value.trim().parse::<u64>().ok())
}

#[cfg(test)]
pub(crate) mod test_server {
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::thread;

    /// Serve each raw response once, in order, then stop accepting.
    ///
    /// Returns the base URL (`http://127.0.0.1:PORT`).
    pub(crate) fn serve_sequence(responses: Vec<Vec<u8>>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for response in responses {
                let Ok((mut stream, _)) = listener.accept() else {
                    return;
                };
                let mut buf = [0u8; 4096];
                let _ = stream.read(&mut buf);
                let _ = stream.write_all(&response);
                let _ = stream.flush();
            }
        });
        format!("http://{addr}")
    }

    pub(crate) fn serve_once(response: impl Into<Vec<u8>>) -> String {
        serve_sequence(vec![response.into()])
    }

    /// A `200 OK` with `Content-Length` and the given body.
    pub(crate) fn ok_with_length(content_type: &str, body: &[u8]) -> Vec<u8> {
        let mut response = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: {content_type}\r\nContent-Length: {}\r\nConnection: close\r\n\r\n",
            body.len()
        )
        .into_bytes();
        response.extend_from_slice(body);
        response
    }
}
