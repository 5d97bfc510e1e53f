pub mod codec;
pub mod encoding;
pub mod handshake;
pub mod packet;

pub use codec::PacketCodec;
pub use handshake::{
    compute_auth_response, create_capabilities, is_auth_switch_request, password_token,
    scramble_response, AuthSwitchRequest, ErrPacket, HandshakeResponse, OkPacket,
    ServerHandshake, SslRequest, DEFAULT_AUTH_PLUGIN,
};
pub use packet::{capabilities, is_eof_packet, is_err_packet, is_ok_packet, Command, Packet};
