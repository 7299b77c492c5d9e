use std::net::SocketAddr;

use axum::Router;
use tokio::task::JoinHandle;

/// An axum router served on `127.0.0.1:<ephemeral>`; aborted on drop.
pub struct TestServer {
    addr: SocketAddr,
    handle: JoinHandle<()>,
}

impl TestServer {
    pub fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

pub async fn spawn_server(router: Router) -> TestServer {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("failed to bind test listener");
    let addr = listener.local_addr().expect("test listener has no address");
    let handle = tokio::spawn(async move {
        axum::serve(listener, router).await.expect("test server failed");
    });
    TestServer { addr, handle }
}
