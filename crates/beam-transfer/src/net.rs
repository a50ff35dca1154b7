/// TCP socket tuning for bulk transfer connections.
use socket2::SockRef;
use tokio::net::TcpStream;

/// Send/receive buffer size requested on every transfer connection.
pub const SOCKET_BUF_SIZE: usize = 16 * 1024 * 1024;

/// Apply throughput-oriented socket options. All of this is best-effort:
/// a platform that refuses a buffer size still transfers correctly.
pub fn tune_stream(stream: &TcpStream) {
    let sock = SockRef::from(stream);
    let _ = sock.set_nodelay(true);
    let _ = sock.set_keepalive(true);
    let _ = sock.set_send_buffer_size(SOCKET_BUF_SIZE);
    let _ = sock.set_recv_buffer_size(SOCKET_BUF_SIZE);
}
