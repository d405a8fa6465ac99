//! Direct passthrough: no handshake, the "upstream socket" already *is*
//! the connection to the target (TCP) or will address the target endpoint
//! on every send (UDP, see `udp_session.rs`).

use crate::error::Result;

pub fn handshake() -> Result<()> {
    Ok(())
}
