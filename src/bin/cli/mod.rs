pub mod args;
pub mod scenario;
pub mod summary;

use stomp_session::{ConnError, SessionError};

/// Exit codes for different error conditions
pub mod exit_codes {
    /// Successful execution
    pub const SUCCESS: u8 = 0;
    /// Network/connection error (e.g., host unreachable, connection refused)
    pub const NETWORK_ERROR: u8 = 1;
    /// Authentication error (e.g., invalid credentials)
    pub const AUTH_ERROR: u8 = 2;
    /// Protocol error (e.g., unexpected server response)
    pub const PROTOCOL_ERROR: u8 = 3;
    /// Bad options or arguments
    pub const USAGE_ERROR: u8 = 4;
}

/// Map a session error to a message and exit code.
pub fn describe_error(err: &SessionError, address: &str) -> (String, u8) {
    let conn = match err {
        SessionError::Connection(conn) | SessionError::Transport(conn) => conn,
        SessionError::InvalidAckMode(_) => return (err.to_string(), exit_codes::USAGE_ERROR),
        other => return (other.to_string(), exit_codes::PROTOCOL_ERROR),
    };
    match conn {
        ConnError::Io(io_err) => {
            let message = match io_err.kind() {
                std::io::ErrorKind::ConnectionRefused => {
                    format!("Connection refused: {}", address)
                }
                std::io::ErrorKind::TimedOut => format!("Connection timed out: {}", address),
                _ => format!("Connection failed: {}", io_err),
            };
            (message, exit_codes::NETWORK_ERROR)
        }
        ConnError::Server(server_err) => (
            format!("Broker rejected the session: {}", server_err),
            exit_codes::AUTH_ERROR,
        ),
        ConnError::HandshakeRejected { status, body } => (
            format!("WebSocket upgrade rejected with {}: {}", status, body),
            exit_codes::AUTH_ERROR,
        ),
        ConnError::WebSocket(_) | ConnError::Tls(_) => {
            (format!("Connection failed: {}", conn), exit_codes::NETWORK_ERROR)
        }
        other => (format!("Protocol error: {}", other), exit_codes::PROTOCOL_ERROR),
    }
}
