use rand::Rng;

use super::{
    admission::{AdmissionPhase, PendingAdmission},
    station_list::{wire_offset, Station},
    Destination, RequestError, Role, TdmaActionIterator, TdmaInstance, TdmaState, TimerKind,
};
use crate::{
    clock::Clock,
    config::{MAX_MTU, MIN_MTU},
    datastructures::{
        common::{StationAddr, StationEntry, StationKind},
        frames::{AckConfFrame, AckTestFrame, CalibrationRequest, Frame},
    },
    scheduler::{CycleInfo, Tick},
    time::{Duration, Time},
    tdma::TdmaAction,
};

impl<C: Clock, R: Rng> TdmaInstance<C, R> {
    pub(super) fn request_master(
        &mut self,
        cycle_period: Option<Duration>,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        if self.state == TdmaState::OtherMaster {
            return Err(RequestError::MasterConflict);
        }
        if self.role == Role::Client {
            return Err(RequestError::WrongRole);
        }
        if !matches!(self.state, TdmaState::Down | TdmaState::MasterDown) {
            return Err(RequestError::WrongState);
        }

        if let Some(cycle_period) = cycle_period {
            if !valid_cycle_period(cycle_period) {
                return Err(RequestError::InvalidCyclePeriod);
            }
            self.set_cycle_period(cycle_period);
            self.nrt_offset = self.config.nrt_offset_for(cycle_period);
        }

        self.role = Role::Master;
        self.set_state(TdmaState::MasterDown);
        Ok(actions![])
    }

    fn ensure_master(&self) -> Result<(), RequestError> {
        if self.state == TdmaState::OtherMaster {
            Err(RequestError::MasterConflict)
        } else if self.role != Role::Master {
            Err(RequestError::WrongRole)
        } else {
            Ok(())
        }
    }

    /// Check that an RT slot fits in the real-time part of the cycle and is
    /// not in use by anyone but `except`
    fn check_rt_offset(
        &self,
        offset: Duration,
        except: Option<StationAddr>,
    ) -> Result<(), RequestError> {
        if offset.is_negative()
            || offset >= self.cycle_period
            || offset >= self.nrt_offset
            || offset.whole_nanos() > i64::from(u32::MAX)
        {
            return Err(RequestError::OffsetOutsideCycle);
        }

        if self.config.master_slots.contains(&offset)
            || self.stations.rt_slot_taken(offset, except)
        {
            return Err(RequestError::SlotTaken);
        }

        Ok(())
    }

    pub(super) fn request_add(
        &mut self,
        station: StationAddr,
        kind: StationKind,
        offset: Duration,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.ensure_master()?;
        if !self.state.is_master_running() {
            return Err(RequestError::WrongState);
        }
        if self.pending.is_some() {
            return Err(RequestError::AlreadyInProgress);
        }
        if station == self.config.station_address || station.is_broadcast() {
            return Err(RequestError::OwnAddress);
        }
        if self.stations.get(station).is_some() {
            return Err(RequestError::AlreadyMember);
        }
        if self.stations.is_full() {
            return Err(RequestError::StationListFull);
        }

        let offset = match kind {
            StationKind::Rt => {
                self.check_rt_offset(offset, None)?;
                offset
            }
            StationKind::Nrt => self.nrt_offset,
        };

        log::info!("Admitting {} station {} at offset {}", kind, station, offset);
        self.pending = Some(PendingAdmission::new(StationEntry {
            address: station,
            kind,
            offset_ns: wire_offset(offset),
        }));

        Ok(self.send_conf())
    }

    /// Start a handshake with the pending candidate
    fn send_conf(&mut self) -> TdmaActionIterator<'_> {
        let Some(pending) = self.pending.as_mut() else {
            return actions![];
        };
        pending.set_phase(AdmissionPhase::SentConf);
        let candidate = pending.entry;

        let frame = Frame::conf(
            self.cycle_parameters(),
            self.stations.table(Some(candidate)),
        );

        self.set_state(TdmaState::MasterSentConf);
        let timer = self.arm_timer(TimerKind::MasterSentConf, self.config.admission_timeout);
        self.send_frame(&frame, Destination::Station(candidate.address), [timer])
    }

    pub(super) fn handle_ack_conf(
        &mut self,
        source: StationAddr,
        frame: AckConfFrame,
    ) -> TdmaActionIterator<'_> {
        if self.state != TdmaState::MasterSentConf {
            return self.discard("ACK_CONF");
        }

        let cycle_period = self.cycle_period;
        let Some(pending) = self.pending.as_mut() else {
            return self.discard("ACK_CONF");
        };
        if pending.address() != source
            || !pending.accepts(frame.cycle_period_ns, cycle_period, frame.offset_ns)
        {
            log::debug!("ACK_CONF from {} does not match the offer", source);
            return self.discard("ACK_CONF");
        }

        pending.set_phase(AdmissionPhase::RcvdConf);
        let counter: u32 = self.rng.gen();
        let xmit_stamp = self.clock.now().wire_nanos();
        pending.test_counter = counter;
        pending.test_xmit_stamp = xmit_stamp;
        pending.set_phase(AdmissionPhase::SentTest);

        self.set_state(TdmaState::MasterSentTest);
        let timer = self.arm_timer(TimerKind::MasterSentTest, self.config.admission_timeout);
        self.send_frame(
            &Frame::test(counter, xmit_stamp),
            Destination::Station(source),
            [timer],
        )
    }

    pub(super) fn handle_ack_test(
        &mut self,
        source: StationAddr,
        frame: AckTestFrame,
        timestamp: Time,
    ) -> TdmaActionIterator<'_> {
        if self.state != TdmaState::MasterSentTest {
            return self.discard("ACK_TEST");
        }

        let Some(pending) = self.pending.as_mut() else {
            return self.discard("ACK_TEST");
        };
        if pending.address() != source
            || pending.test_counter != frame.counter
            || pending.test_xmit_stamp != frame.request_xmit_stamp
        {
            log::debug!("ACK_TEST from {} does not answer our TEST", source);
            return self.discard("ACK_TEST");
        }

        pending.set_phase(AdmissionPhase::RcvdTest);
        let round_trip = pending.round_trip(
            frame.request_xmit_stamp,
            frame.reception_stamp,
            frame.xmit_stamp,
            timestamp.wire_nanos(),
        );
        pending.set_phase(AdmissionPhase::CompTest);

        let entry = pending.entry;
        self.pending = None;
        self.set_state(TdmaState::MasterRunning);
        let cancel = self.cancel_timer();

        let station = Station {
            address: entry.address,
            kind: entry.kind,
            offset: Duration::from_nanos(i64::from(entry.offset_ns)),
            phase: AdmissionPhase::Client,
            round_trip: Some(round_trip),
        };
        if let Err(error) = self.stations.commit(station) {
            log::error!("rtmac bug: Could not commit {}: {}", entry.address, error);
            return actions![cancel];
        }

        log::info!(
            "{} station {} admitted at offset {}, round trip {}",
            entry.kind,
            entry.address,
            station.offset,
            round_trip
        );

        self.send_frame(
            &Frame::ack_ack_conf(entry.offset_ns),
            Destination::Station(source),
            [cancel],
        )
    }

    pub(super) fn handle_expired_admission(&mut self, event: &'static str) -> TdmaActionIterator<'_> {
        if !matches!(
            self.state,
            TdmaState::MasterSentConf | TdmaState::MasterSentTest
        ) {
            return self.discard(event);
        }

        self.admission_failures += 1;
        self.set_state(TdmaState::MasterRunning);

        let Some(mut pending) = self.pending.take() else {
            return actions![];
        };

        if pending.attempt < self.config.max_admission_attempts {
            let delay = self.config.retry_delay(pending.attempt);
            log::info!(
                "Admission of {} timed out ({}), retrying in {} (attempt {}/{})",
                pending.address(),
                event,
                delay,
                pending.attempt + 1,
                self.config.max_admission_attempts
            );
            pending.set_phase(AdmissionPhase::Down);
            pending.attempt += 1;
            self.pending = Some(pending);

            actions![self.arm_timer(TimerKind::AddRt, delay)]
        } else {
            log::warn!(
                "Giving up on admission of {} after {} attempts",
                pending.address(),
                pending.attempt
            );
            actions![]
        }
    }

    pub(super) fn handle_expired_add_rt(&mut self) -> TdmaActionIterator<'_> {
        let retrying = self.state == TdmaState::MasterRunning
            && matches!(self.pending, Some(pending) if !pending.is_negotiating());

        if retrying {
            self.send_conf()
        } else {
            self.discard("EXPIRED_ADD_RT")
        }
    }

    pub(super) fn handle_expired_master_wait(&mut self) -> TdmaActionIterator<'_> {
        if self.state != TdmaState::MasterWait {
            return self.discard("EXPIRED_MASTER_WAIT");
        }

        log::info!("No other master seen, accepting stations");
        self.set_state(TdmaState::MasterRunning);
        actions![]
    }

    pub(super) fn handle_notify_master(&mut self, source: StationAddr) -> TdmaActionIterator<'_> {
        if !self.state.is_master_cycling() {
            return self.discard("NOTIFY_MASTER");
        }

        log::error!(
            "Detected another master {}, stopping the cycle until taken down",
            source
        );
        self.pending = None;
        self.scheduler.stop();
        self.set_state(TdmaState::OtherMaster);
        actions![self.cancel_timer()]
    }

    pub(super) fn request_remove(
        &mut self,
        station: StationAddr,
        kind: StationKind,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.ensure_master()?;

        if let Some(pending) = self.pending {
            if pending.address() == station && pending.entry.kind == kind {
                log::info!("Aborting the admission of {}", station);
                self.pending = None;
                self.set_state(TdmaState::MasterRunning);
                return Ok(actions![self.cancel_timer()]);
            }
        }

        match self.stations.remove(station, kind) {
            Some(removed) => {
                log::info!("Removed {} station {}", removed.kind, removed.address);
                Ok(self.broadcast_station_list())
            }
            None => Err(RequestError::UnknownStation),
        }
    }

    pub(super) fn request_change_cycle(
        &mut self,
        cycle_period: Duration,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.ensure_master()?;
        if !valid_cycle_period(cycle_period) {
            return Err(RequestError::InvalidCyclePeriod);
        }
        if self.pending.is_some() {
            return Err(RequestError::AlreadyInProgress);
        }

        let nrt_offset = self.config.nrt_offset_for(cycle_period);
        let last_rt = self.stations.last_rt_offset();
        let last_master = self.config.master_slots.iter().copied().max();
        if nrt_offset >= cycle_period
            || last_rt.map_or(false, |offset| offset >= nrt_offset)
            || last_master.map_or(false, |offset| offset >= cycle_period)
        {
            return Err(RequestError::OffsetOutsideCycle);
        }

        log::info!("Cycle period changes from {} to {}", self.cycle_period, cycle_period);
        self.set_cycle_period(cycle_period);
        self.nrt_offset = nrt_offset;
        self.stations.set_nrt_offset(nrt_offset);

        Ok(self.broadcast_station_list())
    }

    pub(super) fn request_change_mtu(
        &mut self,
        mtu: u16,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.ensure_master()?;
        if !(MIN_MTU..=MAX_MTU).contains(&mtu) {
            return Err(RequestError::InvalidMtu);
        }

        log::info!("MTU changes from {} to {}", self.mtu, mtu);
        self.mtu = mtu;
        Ok(self.broadcast_station_list())
    }

    pub(super) fn request_change_offset(
        &mut self,
        station: StationAddr,
        offset: Duration,
    ) -> Result<TdmaActionIterator<'_>, RequestError> {
        self.ensure_master()?;
        match self.stations.get(station) {
            Some(entry) if entry.kind == StationKind::Rt => {}
            _ => return Err(RequestError::UnknownStation),
        }
        self.check_rt_offset(offset, Some(station))?;

        if let Some(entry) = self.stations.get_mut(station) {
            log::info!("Moving {} from offset {} to {}", station, entry.offset, offset);
            entry.offset = offset;
        }

        Ok(self.send_frame(
            &Frame::change_offset(wire_offset(offset)),
            Destination::Station(station),
            [],
        ))
    }

    /// Tell every client about the current station list and cycle parameters
    fn broadcast_station_list(&mut self) -> TdmaActionIterator<'_> {
        if !self.state.is_master_running() {
            return actions![];
        }

        let frame = Frame::station_list(self.cycle_parameters(), self.stations.table(None));
        self.send_frame(&frame, Destination::Broadcast, [])
    }

    /// The master cycle tick: announce the cycle and release its waiters
    pub(super) fn master_tick(&mut self) -> TdmaActionIterator<'_> {
        let now = self.clock.now();
        let Some(Tick::Cycle { cycle_start }) = self.scheduler.tick(now) else {
            return actions![];
        };

        let cycle_no = self.cycle_no;
        self.cycle_no += 1;

        let release = TdmaAction::ReleaseCycle {
            info: CycleInfo {
                cycle_no,
                cycle_start,
                clock_offset: Duration::ZERO,
            },
        };

        self.send_frame(
            &Frame::sync(cycle_no, now.wire_nanos(), cycle_start.wire_nanos()),
            Destination::Broadcast,
            [release],
        )
    }

    /// Answer a calibration request of a committed station. The reply carries
    /// the reception time and the time of answering on the master clock.
    pub(super) fn handle_calibration_request(
        &mut self,
        source: StationAddr,
        request: CalibrationRequest,
        timestamp: Time,
    ) -> TdmaActionIterator<'_> {
        if !self.state.is_master_cycling() || self.stations.get(source).is_none() {
            return self.discard("CAL_REQ");
        }

        let xmit_stamp = self.clock.now().wire_nanos();
        self.send_frame(
            &Frame::calibration_reply(request.xmit_stamp, timestamp.wire_nanos(), xmit_stamp),
            Destination::Station(source),
            [],
        )
    }
}

fn valid_cycle_period(cycle_period: Duration) -> bool {
    cycle_period > Duration::ZERO && cycle_period.whole_nanos() <= i64::from(u32::MAX)
}
