//! Arm control core: transports to the controller, the command dispatcher
//! and sequence playback.

pub mod cancel;
pub mod dispatcher;
pub mod player;
pub mod sequence;
pub mod transport;

pub use cancel::CancelSignal;
pub use dispatcher::{CommandDispatcher, DispatcherOptions, SendOutcome, DEFAULT_SEND_TIMEOUT};
pub use player::{
    PlaybackError, PlaybackEvent, PlaybackHandle, PlaybackOutcome, PlaybackReport, PlayerState,
    SequencePlayer,
};
pub use sequence::{SequenceBuilder, SequenceError, SequenceRun};
pub use transport::{
    available_ports, ConnectParams, DefaultTransportFactory, MqttParams, MqttTransport,
    SerialParams, SerialTransport, Transport, TransportError, TransportFactory,
};

#[cfg(test)]
#[path = "tests/support.rs"]
mod test_support;
