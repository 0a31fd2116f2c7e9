//! Per-process request server.
//!
//! Every process serving the shared socket runs its own single-threaded
//! runtime; the kernel decides which process accepts each connection.

use crate::error::ServeError;
use crate::platform;
use axum::{
    body::Body,
    extract::Request,
    http::{header, StatusCode},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    Router,
};
use std::net::TcpListener;
use tracing::{debug, info};

/// Accept and dispatch connections on `listener` until the socket fails.
///
/// Does not return under normal operation.
pub fn serve(listener: TcpListener, app: Router, debug: bool) -> Result<(), ServeError> {
    listener.set_nonblocking(true)?;

    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(ServeError::Runtime)?;

    runtime.block_on(async move {
        let listener = tokio::net::TcpListener::from_std(listener)?;
        let app = if debug {
            app.layer(middleware::from_fn(log_exchange))
        } else {
            app
        };
        axum::serve(listener, app).await
    })?;
    Ok(())
}

/// Application answering every request with the serving process id.
pub fn demo_app() -> Router {
    Router::new().fallback(handle_request)
}

async fn handle_request() -> impl IntoResponse {
    info!("Handling request");
    (
        StatusCode::OK,
        [(header::CONTENT_TYPE, "text/plain")],
        format!("Test WS.\r\nWorker: {}", platform::current_pid()),
    )
}

async fn log_exchange(request: Request<Body>, next: Next) -> Response {
    debug!(
        "{} {} {:?} headers={:?}",
        request.method(),
        request.uri(),
        request.version(),
        request.headers()
    );
    let response = next.run(request).await;
    debug!("-> {} headers={:?}", response.status(), response.headers());
    response
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpStream;
    use std::thread;
    use std::time::Duration;

    fn get(addr: std::net::SocketAddr) -> String {
        let mut stream = TcpStream::connect(addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(10)))
            .unwrap();
        stream
            .write_all(b"GET /anything HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).unwrap();
        response
    }

    #[test]
    fn test_demo_app_reports_pid() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        thread::spawn(move || serve(listener, demo_app(), true));

        let response = get(addr);
        assert!(response.starts_with("HTTP/1.1 200 OK"), "{response}");
        assert!(response.contains("content-type: text/plain"));
        assert!(response.ends_with(&format!("Test WS.\r\nWorker: {}", std::process::id())));
    }
}
