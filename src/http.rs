use std::thread;
use std::time::Duration;

use reqwest::blocking::{Client, RequestBuilder, Response};
use reqwest::header::{HeaderMap, HeaderValue, USER_AGENT};
use tracing::debug;

use crate::error::BcdataError;

const MAX_RETRIES: usize = 3;
const BASE_DELAY_MS: u64 = 200;

pub fn build_client(service: &str, timeout: Duration) -> Result<Client, BcdataError> {
    let mut headers = HeaderMap::new();
    headers.insert(
        USER_AGENT,
        HeaderValue::from_str(&format!("bcdata/{}", env!("CARGO_PKG_VERSION")))
            .map_err(|err| BcdataError::http(service, err))?,
    );
    Client::builder()
        .default_headers(headers)
        .timeout(timeout)
        .build()
        .map_err(|err| BcdataError::http(service, err))
}

pub fn send_with_retries<F>(service: &str, mut make_req: F) -> Result<Response, BcdataError>
where
    F: FnMut() -> RequestBuilder,
{
    let mut attempt = 0usize;
    loop {
        match make_req().send() {
            Ok(resp) => {
                let status = resp.status().as_u16();
                if attempt < MAX_RETRIES && is_retryable_status(status) {
                    debug!(service, status, attempt, "retrying request");
                    backoff(attempt);
                    attempt += 1;
                    continue;
                }
                return Ok(resp);
            }
            Err(err) => {
                if attempt < MAX_RETRIES && is_retryable_error(&err) {
                    debug!(service, attempt, error = %err, "retrying request");
                    backoff(attempt);
                    attempt += 1;
                    continue;
                }
                return Err(BcdataError::http(service, err));
            }
        }
    }
}

pub fn check_status(service: &str, response: Response) -> Result<Response, BcdataError> {
    if response.status().is_success() {
        return Ok(response);
    }
    let status = response.status().as_u16();
    let body = response
        .text()
        .unwrap_or_else(|_| format!("{service} request failed"));
    Err(BcdataError::Upstream {
        service: service.to_string(),
        status,
        body,
    })
}

fn backoff(attempt: usize) {
    let delay = BASE_DELAY_MS * (attempt as u64 + 1);
    thread::sleep(Duration::from_millis(delay));
}

fn is_retryable_status(status: u16) -> bool {
    matches!(status, 429 | 500 | 502 | 503 | 504)
}

fn is_retryable_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

#[cfg(test)]
mod tests {
    use std::io::{Read, Write};
    use std::net::TcpListener;

    use assert_matches::assert_matches;

    use super::*;

    fn serve(responses: Vec<(u16, &'static str)>) -> String {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || {
            for (status, body) in responses {
                let (mut stream, _) = listener.accept().unwrap();
                let mut request = Vec::new();
                let mut buf = [0u8; 1024];
                while !request.windows(4).any(|window| window == b"\r\n\r\n") {
                    let read = stream.read(&mut buf).unwrap();
                    if read == 0 {
                        break;
                    }
                    request.extend_from_slice(&buf[..read]);
                }
                let response = format!(
                    "HTTP/1.1 {status} X\r\nContent-Length: {}\r\nConnection: close\r\n\r\n{body}",
                    body.len()
                );
                stream.write_all(response.as_bytes()).unwrap();
            }
        });
        format!("http://{addr}/geo/pub/wfs")
    }

    #[test]
    fn non_success_status_is_upstream_error() {
        let url = serve(vec![(404, "layer not published")]);
        let client = build_client("wfs", Duration::from_secs(5)).unwrap();
        let response = client.get(&url).send().unwrap();

        let err = check_status("wfs", response).unwrap_err();
        assert_matches!(err, BcdataError::Upstream { ref service, status: 404, ref body } => {
            assert_eq!(service, "wfs");
            assert_eq!(body, "layer not published");
        });
    }

    #[test]
    fn unavailable_is_retried() {
        let url = serve(vec![(503, "busy"), (200, "ok")]);
        let client = build_client("wfs", Duration::from_secs(5)).unwrap();

        let response = send_with_retries("wfs", || client.get(&url)).unwrap();
        let response = check_status("wfs", response).unwrap();
        assert_eq!(response.text().unwrap(), "ok");
    }
}
