use core::fmt::{Display, Formatter};

/// The role a station plays in the TDMA domain
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum Role {
    #[default]
    Unconfigured,
    Master,
    Client,
}

impl Display for Role {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            Role::Unconfigured => write!(f, "Unconfigured"),
            Role::Master => write!(f, "Master"),
            Role::Client => write!(f, "Client"),
        }
    }
}

/// State of the TDMA state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum TdmaState {
    #[default]
    Down,
    MasterDown,
    MasterWait,
    MasterSentConf,
    MasterSentTest,
    MasterRunning,
    ClientDown,
    ClientAckConf,
    ClientRcvdAck,
    ClientRunning,
    /// A second master was detected. Only a `REQUEST_DOWN` leaves this state.
    OtherMaster,
}

impl TdmaState {
    /// Whether a master in this state produces cycles
    pub fn is_master_cycling(&self) -> bool {
        matches!(
            self,
            TdmaState::MasterWait
                | TdmaState::MasterSentConf
                | TdmaState::MasterSentTest
                | TdmaState::MasterRunning
        )
    }

    /// Whether the station is admitted and following the cycle of a master
    pub fn is_client_running(&self) -> bool {
        matches!(self, TdmaState::ClientRunning)
    }

    /// Whether a client is in the middle of the join handshake
    pub fn is_client_joining(&self) -> bool {
        matches!(self, TdmaState::ClientAckConf | TdmaState::ClientRcvdAck)
    }

    /// Whether the master has finished its wait for competing masters
    pub fn is_master_running(&self) -> bool {
        matches!(
            self,
            TdmaState::MasterSentConf | TdmaState::MasterSentTest | TdmaState::MasterRunning
        )
    }
}

impl Display for TdmaState {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        match self {
            TdmaState::Down => write!(f, "Down"),
            TdmaState::MasterDown => write!(f, "MasterDown"),
            TdmaState::MasterWait => write!(f, "MasterWait"),
            TdmaState::MasterSentConf => write!(f, "MasterSentConf"),
            TdmaState::MasterSentTest => write!(f, "MasterSentTest"),
            TdmaState::MasterRunning => write!(f, "MasterRunning"),
            TdmaState::ClientDown => write!(f, "ClientDown"),
            TdmaState::ClientAckConf => write!(f, "ClientAckConf"),
            TdmaState::ClientRcvdAck => write!(f, "ClientRcvdAck"),
            TdmaState::ClientRunning => write!(f, "ClientRunning"),
            TdmaState::OtherMaster => write!(f, "OtherMaster"),
        }
    }
}
