use core::fmt::{Display, Formatter};

use crate::{
    datastructures::{
        common::StationAddr,
        frames::{
            AckAckConfFrame, AckConfFrame, AckTestFrame, ChangeOffsetFrame, ConfFrame,
            StationListFrame, SyncFrame, TestFrame,
        },
    },
    time::{Duration, Time},
};

/// A SYNC frame received from the master being followed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct ReceivedSync {
    pub(crate) source: StationAddr,
    pub(crate) frame: SyncFrame,
    pub(crate) timestamp: Time,
}

/// Everything the state machine reacts to: user requests, received frames
/// and timer expiries
#[derive(Debug, Clone, PartialEq, Eq)]
#[allow(clippy::large_enum_variant)]
pub(crate) enum TdmaEvent {
    RequestMaster {
        cycle_period: Option<Duration>,
    },
    RequestClient,
    RequestUp,
    RequestDown,
    RequestAddRt {
        station: StationAddr,
        offset: Duration,
    },
    RequestRemoveRt {
        station: StationAddr,
    },
    RequestAddNrt {
        station: StationAddr,
    },
    RequestRemoveNrt {
        station: StationAddr,
    },
    ChangeMtu {
        mtu: u16,
    },
    ChangeCycle {
        cycle_period: Duration,
    },
    ChangeOffset {
        station: StationAddr,
        offset: Duration,
    },
    RequestChangeOffset {
        source: StationAddr,
        frame: ChangeOffsetFrame,
    },
    RequestConf {
        source: StationAddr,
        frame: ConfFrame,
    },
    AckConf {
        source: StationAddr,
        frame: AckConfFrame,
    },
    AckAckConf {
        source: StationAddr,
        frame: AckAckConfFrame,
    },
    RequestTest {
        source: StationAddr,
        frame: TestFrame,
        timestamp: Time,
    },
    AckTest {
        source: StationAddr,
        frame: AckTestFrame,
        timestamp: Time,
    },
    StationList {
        source: StationAddr,
        frame: StationListFrame,
    },
    NotifyMaster {
        source: StationAddr,
    },
    ExpiredAddRt,
    ExpiredMasterWait,
    ExpiredMasterSentConf,
    ExpiredMasterSentTest,
    ExpiredClientSentAck,
    /// The local cycle tick when `sync` is `None`, otherwise a SYNC from the
    /// master
    StartOfFrame {
        sync: Option<ReceivedSync>,
    },
}

impl TdmaEvent {
    pub(crate) fn name(&self) -> &'static str {
        match self {
            TdmaEvent::RequestMaster { .. } => "REQUEST_MASTER",
            TdmaEvent::RequestClient => "REQUEST_CLIENT",
            TdmaEvent::RequestUp => "REQUEST_UP",
            TdmaEvent::RequestDown => "REQUEST_DOWN",
            TdmaEvent::RequestAddRt { .. } => "REQUEST_ADD_RT",
            TdmaEvent::RequestRemoveRt { .. } => "REQUEST_REMOVE_RT",
            TdmaEvent::RequestAddNrt { .. } => "REQUEST_ADD_NRT",
            TdmaEvent::RequestRemoveNrt { .. } => "REQUEST_REMOVE_NRT",
            TdmaEvent::ChangeMtu { .. } => "CHANGE_MTU",
            TdmaEvent::ChangeCycle { .. } => "CHANGE_CYCLE",
            TdmaEvent::ChangeOffset { .. } => "CHANGE_OFFSET",
            TdmaEvent::RequestChangeOffset { .. } => "REQUEST_CHANGE_OFFSET",
            TdmaEvent::RequestConf { .. } => "REQUEST_CONF",
            TdmaEvent::AckConf { .. } => "ACK_CONF",
            TdmaEvent::AckAckConf { .. } => "ACK_ACK_CONF",
            TdmaEvent::RequestTest { .. } => "REQUEST_TEST",
            TdmaEvent::AckTest { .. } => "ACK_TEST",
            TdmaEvent::StationList { .. } => "STATION_LIST",
            TdmaEvent::NotifyMaster { .. } => "NOTIFY_MASTER",
            TdmaEvent::ExpiredAddRt => "EXPIRED_ADD_RT",
            TdmaEvent::ExpiredMasterWait => "EXPIRED_MASTER_WAIT",
            TdmaEvent::ExpiredMasterSentConf => "EXPIRED_MASTER_SENT_CONF",
            TdmaEvent::ExpiredMasterSentTest => "EXPIRED_MASTER_SENT_TEST",
            TdmaEvent::ExpiredClientSentAck => "EXPIRED_CLIENT_SENT_ACK",
            TdmaEvent::StartOfFrame { .. } => "START_OF_FRAME",
        }
    }
}

impl Display for TdmaEvent {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Reasons a control request is rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum RequestError {
    #[cfg_attr(feature = "std", error("request does not apply to the current role"))]
    WrongRole,
    #[cfg_attr(feature = "std", error("request does not apply to the current state"))]
    WrongState,
    #[cfg_attr(feature = "std", error("another admission is already in progress"))]
    AlreadyInProgress,
    #[cfg_attr(
        feature = "std",
        error("another master was detected, take the station down first")
    )]
    MasterConflict,
    #[cfg_attr(feature = "std", error("station is not in the station list"))]
    UnknownStation,
    #[cfg_attr(feature = "std", error("station is already in the station list"))]
    AlreadyMember,
    #[cfg_attr(feature = "std", error("the requested slot is taken"))]
    SlotTaken,
    #[cfg_attr(feature = "std", error("the offset lies outside the cycle"))]
    OffsetOutsideCycle,
    #[cfg_attr(feature = "std", error("the station list is full"))]
    StationListFull,
    #[cfg_attr(feature = "std", error("invalid cycle period"))]
    InvalidCyclePeriod,
    #[cfg_attr(feature = "std", error("mtu outside of the supported range"))]
    InvalidMtu,
    #[cfg_attr(feature = "std", error("a station cannot admit itself"))]
    OwnAddress,
}

#[cfg(not(feature = "std"))]
impl Display for RequestError {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        let text = match self {
            RequestError::WrongRole => "request does not apply to the current role",
            RequestError::WrongState => "request does not apply to the current state",
            RequestError::AlreadyInProgress => "another admission is already in progress",
            RequestError::MasterConflict => {
                "another master was detected, take the station down first"
            }
            RequestError::UnknownStation => "station is not in the station list",
            RequestError::AlreadyMember => "station is already in the station list",
            RequestError::SlotTaken => "the requested slot is taken",
            RequestError::OffsetOutsideCycle => "the offset lies outside the cycle",
            RequestError::StationListFull => "the station list is full",
            RequestError::InvalidCyclePeriod => "invalid cycle period",
            RequestError::InvalidMtu => "mtu outside of the supported range",
            RequestError::OwnAddress => "a station cannot admit itself",
        };

        f.write_str(text)
    }
}
