//! The TDMA state machine of one attached interface.
//!
//! See [`TdmaInstance`] for a detailed description.

use arrayvec::ArrayVec;
use rand::Rng;

pub use actions::{Destination, TdmaAction, TdmaActionIterator, TimerId, TimerKind};
pub use admission::AdmissionPhase;
pub use event::RequestError;
pub use state::{Role, TdmaState};
pub use station_list::Station;

use self::{
    admission::PendingAdmission,
    event::{ReceivedSync, TdmaEvent},
    station_list::{wire_offset, StationList},
};
pub use crate::datastructures::frames::MAX_DATA_LEN;
use crate::{
    clock::{Clock, ClockModel},
    config::{TdmaConfig, MAX_MASTER_SLOTS},
    datastructures::{
        common::{CycleParameters, StationAddr, StationKind},
        frames::{Frame, FrameBody},
    },
    observability::{PendingSnapshot, StationSnapshot, TdmaCounters, TdmaSnapshot},
    scheduler::CycleScheduler,
    time::{Duration, Time},
};

// Needs to be here because of use rules
macro_rules! actions {
    [] => {
        {
            crate::tdma::TdmaActionIterator::from(::arrayvec::ArrayVec::new())
        }
    };
    [$action:expr] => {
        {
            let mut list = ::arrayvec::ArrayVec::new();
            list.push($action);
            crate::tdma::TdmaActionIterator::from(list)
        }
    };
    [$action1:expr, $action2:expr] => {
        {
            let mut list = ::arrayvec::ArrayVec::new();
            list.push($action1);
            list.push($action2);
            crate::tdma::TdmaActionIterator::from(list)
        }
    };
}

mod actions;
mod admission;
mod client;
mod event;
mod master;
mod state;
mod station_list;
#[cfg(test)]
mod tests;

/// The TDMA discipline of a single interface
///
/// A [`TdmaInstance`] is created when the discipline is attached to an
/// interface and owns everything the discipline knows: role and state, the
/// station list, the clock model and the cycle scheduler. All of it is only
/// changed by dispatching events, one at a time.
///
/// # Generics
/// A [`TdmaInstance`] is generic over:
/// * **`C`**: The type of the [`Clock`] used to timestamp transmissions and to
///   drive the cycle
/// * **`R`**: The type of the random number generator ([`Rng`]) used to pick
///   the counters of admission test exchanges
///
/// # Driving the instance
/// The embedding runtime informs the instance about everything that happens
/// through the `handle_*` methods and the control requests
/// ([`become_master`](Self::become_master), [`add_station`](Self::add_station),
/// ...). Each of them returns the [`TdmaAction`]s the runtime has to perform:
///
/// ```no_run
/// use rtmac::tdma::{TdmaAction, TdmaActionIterator};
///
/// # mod system {
/// #     pub struct Timer;
/// #     impl Timer {
/// #         pub fn expire_in(&mut self, _: rtmac::tdma::TimerId, _: core::time::Duration) {}
/// #         pub fn cancel(&mut self) {}
/// #     }
/// #     pub struct Socket;
/// #     impl Socket {
/// #         pub fn send(&mut self, _: rtmac::datastructures::common::StationAddr, _: &[u8]) {}
/// #     }
/// #     pub struct Waiters;
/// #     impl Waiters {
/// #         pub fn release(&mut self, _: rtmac::scheduler::CycleInfo) {}
/// #     }
/// # }
/// struct Resources {
///     timer: system::Timer,
///     socket: system::Socket,
///     waiters: system::Waiters,
/// }
///
/// fn handle_actions(resources: &mut Resources, actions: TdmaActionIterator) {
///     for action in actions {
///         match action {
///             TdmaAction::SendFrame { destination, data } => {
///                 resources.socket.send(destination.address(), data)
///             }
///             TdmaAction::ResetTimer { timer, duration } => {
///                 resources.timer.expire_in(timer, duration)
///             }
///             TdmaAction::CancelTimer => resources.timer.cancel(),
///             TdmaAction::ReleaseCycle { info } => resources.waiters.release(info),
///         }
///     }
/// }
/// ```
///
/// Besides its timer, the runtime calls [`handle_tick`](Self::handle_tick) at
/// the time reported by [`next_tick`](Self::next_tick).
#[derive(Debug)]
pub struct TdmaInstance<C, R> {
    config: TdmaConfig,
    clock: C,
    rng: R,
    role: Role,
    state: TdmaState,
    cycle_no: u64,
    // Client: local minus master cycle numbering
    cycle_no_shift: u64,
    cycle_period: Duration,
    mtu: u16,
    nrt_offset: Duration,
    clock_model: ClockModel,
    scheduler: CycleScheduler,
    stations: StationList,
    pending: Option<PendingAdmission>,
    timer: Option<TimerId>,
    timer_generation: u32,
    // Client: the master whose cycle is followed, and the own slot
    master: Option<StationAddr>,
    own_offset: Option<Duration>,
    malformed_frames: u64,
    discarded_events: u64,
    admission_failures: u64,
    packet_buffer: [u8; MAX_DATA_LEN],
}

impl<C, R> TdmaInstance<C, R> {
    /// Create an instance in the [`Down`](TdmaState::Down) state
    pub fn new(config: TdmaConfig, clock: C, rng: R) -> Self {
        let cycle_period = config.cycle_period;

        TdmaInstance {
            cycle_period,
            mtu: config.mtu,
            nrt_offset: config.nrt_offset_for(cycle_period),
            clock_model: ClockModel::new(config.calibration_rounds),
            scheduler: CycleScheduler::new(cycle_period, config.grace_window_for(cycle_period)),
            config,
            clock,
            rng,
            role: Role::Unconfigured,
            state: TdmaState::Down,
            cycle_no: 0,
            cycle_no_shift: 0,
            stations: StationList::new(),
            pending: None,
            timer: None,
            timer_generation: 0,
            master: None,
            own_offset: None,
            malformed_frames: 0,
            discarded_events: 0,
            admission_failures: 0,
            packet_buffer: [0; MAX_DATA_LEN],
        }
    }

    pub fn config(&self) -> &TdmaConfig {
        &self.config
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> TdmaState {
        self.state
    }

    /// Number of the next cycle
    pub fn cycle_no(&self) -> u64 {
        self.cycle_no
    }

    pub fn cycle_period(&self) -> Duration {
        self.cycle_period
    }

    /// Master minus local clock
    pub fn clock_offset(&self) -> Duration {
        self.clock_model.offset()
    }

    /// Master minus local clock in whole nanoseconds
    pub fn time_offset(&self) -> i64 {
        self.clock_model.offset().whole_nanos()
    }

    /// Whether the instance produces or follows cycles
    pub fn is_cycling(&self) -> bool {
        self.state.is_master_cycling() || self.state.is_client_running()
    }

    /// When [`handle_tick`](Self::handle_tick) should be called next, on the
    /// local clock
    pub fn next_tick(&self) -> Option<Time> {
        if self.is_cycling() {
            self.scheduler.deadline()
        } else {
            None
        }
    }

    /// Offsets from the cycle start of the transmit slots this station owns
    pub fn transmit_slots(&self) -> ArrayVec<Duration, MAX_MASTER_SLOTS> {
        if self.state.is_master_cycling() {
            self.config.master_slots.clone()
        } else if self.state.is_client_running() {
            self.own_offset.into_iter().collect()
        } else {
            ArrayVec::new()
        }
    }

    /// The committed stations, only populated on a master
    pub fn stations(&self) -> impl Iterator<Item = &Station> {
        self.stations.iter()
    }

    /// Read-only view on the instance for diagnostics
    pub fn snapshot(&self) -> TdmaSnapshot {
        TdmaSnapshot {
            station_address: self.config.station_address,
            role: self.role,
            state: self.state,
            cycle_no: self.cycle_no,
            clock_offset_ns: self.time_offset(),
            packet_delay_ns: self.clock_model.packet_delay().whole_nanos(),
            cycle_period_ns: self.cycle_period.whole_nanos(),
            mtu: self.mtu,
            calibrated: self.role == Role::Client
                && self.state.is_client_running()
                && self.clock_model.is_calibrated(),
            master: self.master,
            own_offset_ns: self.own_offset.map(|offset| offset.whole_nanos()),
            pending: self.pending.map(|pending| PendingSnapshot {
                address: pending.entry.address,
                kind: pending.entry.kind,
                offset_ns: pending.entry.offset_ns,
                phase: pending.phase,
                attempt: pending.attempt,
            }),
            stations: self
                .stations
                .iter()
                .map(|station| StationSnapshot {
                    address: station.address,
                    kind: station.kind,
                    offset_ns: station.offset.whole_nanos(),
                    phase: station.phase,
                    round_trip_ns: station.round_trip.map(|rtt| rtt.whole_nanos()),
                })
                .collect(),
            counters: TdmaCounters {
                malformed_frames: self.malformed_frames,
                discarded_events: self.discarded_events,
                missed_cycles: self.scheduler.missed_cycles(),
                deadline_misses: self.scheduler.deadline_misses(),
                admission_failures: self.admission_failures,
            },
        }
    }

    fn set_state(&mut self, state: TdmaState) {
        if self.state != state {
            log::info!(
                "new TDMA state for {}: {} -> {}",
                self.config.station_address,
                self.state,
                state
            );
            self.state = state;
        }
    }

    /// Arm the state timer with a fresh id, replacing any previous arming
    fn arm_timer(&mut self, kind: TimerKind, duration: Duration) -> TdmaAction<'static> {
        self.timer_generation = self.timer_generation.wrapping_add(1);
        let timer = TimerId {
            kind,
            generation: self.timer_generation,
        };
        self.timer = Some(timer);

        TdmaAction::ResetTimer {
            timer,
            duration: duration.into(),
        }
    }

    fn cancel_timer(&mut self) -> TdmaAction<'static> {
        self.timer = None;
        TdmaAction::CancelTimer
    }

    fn discard<'a>(&mut self, event: &'static str) -> TdmaActionIterator<'a> {
        log::debug!("Discarding {} in state {}", event, self.state);
        self.discarded_events += 1;
        actions![]
    }

    fn send_frame<const N: usize>(
        &mut self,
        frame: &Frame,
        destination: Destination,
        others: [TdmaAction<'static>; N],
    ) -> TdmaActionIterator<'_> {
        let mut list = ArrayVec::new();

        match frame.serialize(&mut self.packet_buffer) {
            Ok(length) => {
                log::trace!("Sending {:?} to {:?}", frame.frame_id(), destination);
                list.push(TdmaAction::SendFrame {
                    destination,
                    data: &self.packet_buffer[..length],
                });
            }
            Err(error) => {
                log::error!(
                    "rtmac bug: Could not serialize {:?}: {:?}",
                    frame.frame_id(),
                    error
                );
            }
        }

        for action in others {
            if list.try_push(action).is_err() {
                log::error!("rtmac bug: Too many actions for a single event");
            }
        }

        TdmaActionIterator::from(list)
    }

    fn cycle_parameters(&self) -> CycleParameters {
        CycleParameters {
            cycle_period_ns: self.cycle_period.whole_nanos().max(0) as u64,
            mtu: self.mtu,
            nrt_offset_ns: wire_offset(self.nrt_offset),
        }
    }

    fn set_cycle_period(&mut self, cycle_period: Duration) {
        self.cycle_period = cycle_period;
        self.scheduler.set_period(cycle_period);
        self.scheduler
            .set_grace_window(self.config.grace_window_for(cycle_period));
    }
}

impl<C: Clock, R: Rng> TdmaInstance<C, R> {
    /// Take the master role, optionally with a cycle period other than the
    /// configured one (`REQUEST_MASTER`)
    pub fn become_master(
        &mut self,
        cycle_period: Option<Duration>,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.dispatch(TdmaEvent::RequestMaster { cycle_period })
    }

    /// Take the client role and listen for a CONF (`REQUEST_CLIENT`)
    pub fn become_client(&mut self) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.dispatch(TdmaEvent::RequestClient)
    }

    /// Start cycling as master (`REQUEST_UP`). A no-op for clients.
    pub fn up(&mut self) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.dispatch(TdmaEvent::RequestUp)
    }

    /// Return to [`Down`](TdmaState::Down) from any state (`REQUEST_DOWN`)
    pub fn down(&mut self) -> TdmaActionIterator<'static> {
        self.request_down()
    }

    /// Admit a station (`REQUEST_ADD_RT`/`REQUEST_ADD_NRT`). The offset is
    /// only used for RT stations, NRT stations share the non-real-time window.
    pub fn add_station(
        &mut self,
        station: StationAddr,
        kind: StationKind,
        offset: Duration,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        match kind {
            StationKind::Rt => self.dispatch(TdmaEvent::RequestAddRt { station, offset }),
            StationKind::Nrt => self.dispatch(TdmaEvent::RequestAddNrt { station }),
        }
    }

    /// Remove a station (`REQUEST_REMOVE_RT`/`REQUEST_REMOVE_NRT`)
    pub fn remove_station(
        &mut self,
        station: StationAddr,
        kind: StationKind,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        match kind {
            StationKind::Rt => self.dispatch(TdmaEvent::RequestRemoveRt { station }),
            StationKind::Nrt => self.dispatch(TdmaEvent::RequestRemoveNrt { station }),
        }
    }

    /// Change the cycle period (`CHANGE_CYCLE`)
    pub fn change_cycle(
        &mut self,
        cycle_period: Duration,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.dispatch(TdmaEvent::ChangeCycle { cycle_period })
    }

    /// Change the non-real-time payload limit (`CHANGE_MTU`)
    pub fn change_mtu(&mut self, mtu: u16) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.dispatch(TdmaEvent::ChangeMtu { mtu })
    }

    /// Move a committed RT station to another slot (`CHANGE_OFFSET`)
    pub fn change_offset(
        &mut self,
        station: StationAddr,
        offset: Duration,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.dispatch(TdmaEvent::ChangeOffset { station, offset })
    }

    /// Handle a frame received under the RTmac ethertype
    pub fn handle_receive(
        &mut self,
        data: &[u8],
        source: StationAddr,
        timestamp: Time,
    ) -> TdmaActionIterator<'_> {
        if source == self.config.station_address {
            return actions![];
        }

        let frame = match Frame::deserialize(data) {
            Ok(frame) => frame,
            Err(error) => {
                self.malformed_frames += 1;
                log::warn!("Could not parse frame from {}: {:?}", source, error);
                return actions![];
            }
        };

        let event = match frame.body {
            FrameBody::Sync(_) if self.state.is_master_cycling() => {
                TdmaEvent::NotifyMaster { source }
            }
            FrameBody::Sync(frame) => TdmaEvent::StartOfFrame {
                sync: Some(ReceivedSync {
                    source,
                    frame,
                    timestamp,
                }),
            },
            FrameBody::CalibrationRequest(request) => {
                return self.handle_calibration_request(source, request, timestamp)
            }
            FrameBody::CalibrationReply(reply) => {
                return self.handle_calibration_reply(source, reply, timestamp)
            }
            FrameBody::Conf(frame) => TdmaEvent::RequestConf { source, frame },
            FrameBody::AckConf(frame) => TdmaEvent::AckConf { source, frame },
            FrameBody::AckAckConf(frame) => TdmaEvent::AckAckConf { source, frame },
            FrameBody::Test(frame) => TdmaEvent::RequestTest {
                source,
                frame,
                timestamp,
            },
            FrameBody::AckTest(frame) => TdmaEvent::AckTest {
                source,
                frame,
                timestamp,
            },
            FrameBody::StationList(frame) => TdmaEvent::StationList { source, frame },
            FrameBody::ChangeOffset(frame) => TdmaEvent::RequestChangeOffset { source, frame },
        };

        self.handle_event(event)
    }

    /// Handle the expiry of the instance timer
    pub fn handle_timer(&mut self, timer: TimerId) -> TdmaActionIterator<'_> {
        if self.timer != Some(timer) {
            log::debug!("Discarding stale {:?} timer expiry", timer.kind);
            return actions![];
        }
        self.timer = None;

        let event = match timer.kind {
            TimerKind::AddRt => TdmaEvent::ExpiredAddRt,
            TimerKind::MasterWait => TdmaEvent::ExpiredMasterWait,
            TimerKind::MasterSentConf => TdmaEvent::ExpiredMasterSentConf,
            TimerKind::MasterSentTest => TdmaEvent::ExpiredMasterSentTest,
            TimerKind::ClientSentAck => TdmaEvent::ExpiredClientSentAck,
        };

        self.handle_event(event)
    }

    /// Handle the cycle tick requested through [`next_tick`](Self::next_tick)
    pub fn handle_tick(&mut self) -> TdmaActionIterator<'_> {
        self.handle_event(TdmaEvent::StartOfFrame { sync: None })
    }

    fn handle_event(&mut self, event: TdmaEvent) -> TdmaActionIterator<'_> {
        let name = event.name();
        match self.dispatch(event) {
            Ok(actions) => actions,
            Err(error) => {
                log::error!("rtmac bug: {} was rejected: {:?}", name, error);
                actions![]
            }
        }
    }

    /// Run one event to completion
    fn dispatch(&mut self, event: TdmaEvent) -> Result<TdmaActionIterator<'_>, RequestError> {
        let name = event.name();
        let state = self.state;
        log::trace!("{} in state {}", name, state);

        let result = match event {
            TdmaEvent::RequestMaster { cycle_period } => self.request_master(cycle_period),
            TdmaEvent::RequestClient => self.request_client(),
            TdmaEvent::RequestUp => self.request_up(),
            TdmaEvent::RequestDown => Ok(self.request_down()),
            TdmaEvent::RequestAddRt { station, offset } => {
                self.request_add(station, StationKind::Rt, offset)
            }
            TdmaEvent::RequestAddNrt { station } => {
                self.request_add(station, StationKind::Nrt, Duration::ZERO)
            }
            TdmaEvent::RequestRemoveRt { station } => {
                self.request_remove(station, StationKind::Rt)
            }
            TdmaEvent::RequestRemoveNrt { station } => {
                self.request_remove(station, StationKind::Nrt)
            }
            TdmaEvent::ChangeMtu { mtu } => self.request_change_mtu(mtu),
            TdmaEvent::ChangeCycle { cycle_period } => self.request_change_cycle(cycle_period),
            TdmaEvent::ChangeOffset { station, offset } => {
                self.request_change_offset(station, offset)
            }
            TdmaEvent::RequestChangeOffset { source, frame } => {
                Ok(self.handle_change_offset(source, frame))
            }
            TdmaEvent::RequestConf { source, frame } => Ok(self.handle_conf(source, frame)),
            TdmaEvent::AckConf { source, frame } => Ok(self.handle_ack_conf(source, frame)),
            TdmaEvent::AckAckConf { source, frame } => {
                Ok(self.handle_ack_ack_conf(source, frame))
            }
            TdmaEvent::RequestTest {
                source,
                frame,
                timestamp,
            } => Ok(self.handle_test(source, frame, timestamp)),
            TdmaEvent::AckTest {
                source,
                frame,
                timestamp,
            } => Ok(self.handle_ack_test(source, frame, timestamp)),
            TdmaEvent::StationList { source, frame } => {
                Ok(self.handle_station_list(source, frame))
            }
            TdmaEvent::NotifyMaster { source } => Ok(self.handle_notify_master(source)),
            TdmaEvent::ExpiredAddRt => Ok(self.handle_expired_add_rt()),
            TdmaEvent::ExpiredMasterWait => Ok(self.handle_expired_master_wait()),
            TdmaEvent::ExpiredMasterSentConf | TdmaEvent::ExpiredMasterSentTest => {
                Ok(self.handle_expired_admission(name))
            }
            TdmaEvent::ExpiredClientSentAck => Ok(self.handle_expired_client_sent_ack()),
            TdmaEvent::StartOfFrame { sync: None } => Ok(self.handle_start_of_frame()),
            TdmaEvent::StartOfFrame { sync: Some(sync) } => Ok(self.handle_sync(sync)),
        };

        if let Err(error) = &result {
            log::debug!("{} rejected in state {}: {}", name, state, error);
        }

        result
    }

    fn request_up(&mut self) -> Result<TdmaActionIterator<'_>, RequestError> {
        match self.state {
            TdmaState::MasterDown => {
                let now = self.clock.now();
                self.scheduler.start_master(now);
                self.set_state(TdmaState::MasterWait);

                let wait = self.cycle_period * self.config.master_wait_cycles;
                Ok(actions![self.arm_timer(TimerKind::MasterWait, wait)])
            }
            TdmaState::OtherMaster => Err(RequestError::MasterConflict),
            TdmaState::Down => Err(RequestError::WrongRole),
            // Already cycling, or a client which comes up with its CONF
            _ => Ok(actions![]),
        }
    }

    fn request_down<'a>(&mut self) -> TdmaActionIterator<'a> {
        log::info!("Taking {} down", self.config.station_address);

        self.scheduler.stop();
        self.clock_model.reset();
        self.stations.clear();
        self.pending = None;
        self.master = None;
        self.own_offset = None;
        self.role = Role::Unconfigured;
        self.set_state(TdmaState::Down);

        actions![self.cancel_timer()]
    }

    fn handle_start_of_frame(&mut self) -> TdmaActionIterator<'_> {
        if self.state.is_master_cycling() {
            self.master_tick()
        } else if self.state.is_client_running() {
            self.client_tick()
        } else {
            self.discard("START_OF_FRAME")
        }
    }
}
