pub mod delta;
pub mod framing;
pub mod game_session;
pub mod protocol;
pub mod queue;
pub mod tcp;
pub mod transport;
