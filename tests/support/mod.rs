pub mod client;
pub mod harness;
pub mod upstream;

use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream};

/// Grabs an ephemeral port. The tiny window between dropping the probe
/// listener and the server binding it is acceptable in tests.
pub async fn find_free_port() -> u16 {
    let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind probe listener");
    let port = listener.local_addr().expect("probe listener addr").port();
    drop(listener);
    port
}

pub async fn wait_for_listener(addr: SocketAddr) {
    for _ in 0..100 {
        if TcpStream::connect(addr).await.is_ok() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("listener on {addr} did not come up");
}
