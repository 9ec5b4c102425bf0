//! Per-connection state of a tunnel link

/// Lifecycle of the relay connection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    Disconnected,
    Connecting,
    AwaitingGreeting,
    AwaitingLoginAck,
    Active,
    Suspended,
}

impl LinkState {
    /// True while a relay transport is open
    pub fn is_connected(self) -> bool {
        !matches!(self, LinkState::Disconnected | LinkState::Connecting)
    }

    /// True once forwarding has been started
    pub fn is_live(self) -> bool {
        matches!(self, LinkState::Active | LinkState::Suspended)
    }
}

/// State of one relay connection. A fresh value is created for every
/// connection attempt and dropped on disconnect.
#[derive(Debug, Clone)]
pub struct Session {
    pub generation: u64,
    pub state: LinkState,
    /// Assigned by the relay on login
    pub primary: bool,
    pub suspend: Option<Vec<u8>>,
    /// Appended to every response sent upstream
    pub eof: Option<Vec<u8>>,
    /// Set by pongs, cleared by each heartbeat tick
    pub alive: bool,
}

impl Session {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            state: LinkState::Connecting,
            primary: false,
            suspend: None,
            eof: None,
            alive: true,
        }
    }

    /// Session value used while no relay connection exists
    pub fn disconnected(generation: u64) -> Self {
        Self {
            state: LinkState::Disconnected,
            ..Self::new(generation)
        }
    }
}
