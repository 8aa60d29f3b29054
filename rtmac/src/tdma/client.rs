use rand::Rng;

use super::{
    event::ReceivedSync, Destination, RequestError, Role, TdmaAction, TdmaActionIterator,
    TdmaInstance, TdmaState, TimerKind,
};
use crate::{
    clock::{CalibrationSample, Clock, SyncSample},
    datastructures::{
        common::{CycleParameters, StationAddr},
        frames::{
            AckAckConfFrame, CalibrationReply, ChangeOffsetFrame, ConfFrame, Frame,
            StationListFrame, TestFrame,
        },
    },
    scheduler::{CycleInfo, Tick},
    time::{Duration, Time},
};

impl<C: Clock, R: Rng> TdmaInstance<C, R> {
    pub(super) fn request_client(&mut self) -> Result<TdmaActionIterator<'_>, RequestError> {
        if self.state == TdmaState::OtherMaster {
            return Err(RequestError::MasterConflict);
        }
        if self.role == Role::Master {
            return Err(RequestError::WrongRole);
        }
        if !matches!(self.state, TdmaState::Down | TdmaState::ClientDown) {
            return Err(RequestError::WrongState);
        }

        self.role = Role::Client;
        self.set_state(TdmaState::ClientDown);
        Ok(actions![])
    }

    /// Take over cycle parameters announced by the master. Returns false when
    /// they make no sense.
    fn apply_parameters(&mut self, params: &CycleParameters) -> bool {
        let Ok(period_ns) = i64::try_from(params.cycle_period_ns) else {
            return false;
        };
        if period_ns <= 0 || u64::from(params.nrt_offset_ns) >= params.cycle_period_ns {
            return false;
        }

        let cycle_period = Duration::from_nanos(period_ns);
        if cycle_period != self.cycle_period {
            log::info!("Cycle period is now {}", cycle_period);
            self.set_cycle_period(cycle_period);
        }
        self.mtu = params.mtu;
        self.nrt_offset = Duration::from_nanos(i64::from(params.nrt_offset_ns));
        true
    }

    pub(super) fn handle_conf(
        &mut self,
        source: StationAddr,
        frame: ConfFrame,
    ) -> TdmaActionIterator<'_> {
        let applies = match self.state {
            TdmaState::ClientDown => true,
            // A running client is offered a slot again when the master never
            // saw the end of the previous handshake
            TdmaState::ClientAckConf | TdmaState::ClientRcvdAck | TdmaState::ClientRunning => {
                self.master == Some(source)
            }
            _ => false,
        };
        if !applies {
            return self.discard("REQUEST_CONF");
        }

        let Some(entry) = frame.entry(self.config.station_address).copied() else {
            log::debug!("CONF from {} does not list us", source);
            return self.discard("REQUEST_CONF");
        };
        if u64::from(entry.offset_ns) >= frame.params.cycle_period_ns
            || !self.apply_parameters(&frame.params)
        {
            log::warn!("Ignoring CONF from {} with invalid cycle parameters", source);
            return self.discard("REQUEST_CONF");
        }

        log::info!(
            "Offered {} slot at offset {}ns by {}",
            entry.kind,
            entry.offset_ns,
            source
        );
        if self.state.is_client_running() {
            log::warn!("{} restarts our admission", source);
            self.scheduler.stop();
            self.clock_model.reset();
        }
        self.master = Some(source);
        self.own_offset = Some(Duration::from_nanos(i64::from(entry.offset_ns)));
        self.set_state(TdmaState::ClientAckConf);

        let timer = self.arm_timer(TimerKind::ClientSentAck, self.config.admission_timeout);
        self.send_frame(
            &Frame::ack_conf(frame.params.cycle_period_ns, entry.offset_ns),
            Destination::Station(source),
            [timer],
        )
    }

    pub(super) fn handle_test(
        &mut self,
        source: StationAddr,
        frame: TestFrame,
        timestamp: Time,
    ) -> TdmaActionIterator<'_> {
        if !self.state.is_client_joining() || self.master != Some(source) {
            return self.discard("REQUEST_TEST");
        }

        self.set_state(TdmaState::ClientRcvdAck);
        let timer = self.arm_timer(TimerKind::ClientSentAck, self.config.admission_timeout);
        let xmit_stamp = self.clock.now().wire_nanos();
        self.send_frame(
            &Frame::ack_test(
                frame.counter,
                frame.xmit_stamp,
                timestamp.wire_nanos(),
                xmit_stamp,
            ),
            Destination::Station(source),
            [timer],
        )
    }

    pub(super) fn handle_ack_ack_conf(
        &mut self,
        source: StationAddr,
        frame: AckAckConfFrame,
    ) -> TdmaActionIterator<'_> {
        if !self.state.is_client_joining() || self.master != Some(source) {
            return self.discard("ACK_ACK_CONF");
        }

        self.own_offset = Some(Duration::from_nanos(i64::from(frame.offset_ns)));
        actions![self.join_cycle(source)]
    }

    /// Having passed the TEST round trip, frames of the master that commit
    /// us stand in for a lost ACK_ACK_CONF
    fn joins_implicitly(&self, source: StationAddr) -> bool {
        self.state == TdmaState::ClientRcvdAck && self.master == Some(source)
    }

    fn join_cycle(&mut self, source: StationAddr) -> TdmaAction<'static> {
        log::info!(
            "Joined the cycle of {} at offset {}",
            source,
            self.own_offset.unwrap_or(Duration::ZERO)
        );

        self.clock_model.reset();
        self.scheduler.start_client();
        self.set_state(TdmaState::ClientRunning);
        self.cancel_timer()
    }

    pub(super) fn handle_expired_client_sent_ack(&mut self) -> TdmaActionIterator<'_> {
        if !self.state.is_client_joining() {
            return self.discard("EXPIRED_CLIENT_SENT_ACK");
        }

        if let Some(master) = self.master {
            log::warn!("Admission by {} stalled, waiting for a new CONF", master);
        }
        self.master = None;
        self.own_offset = None;
        self.set_state(TdmaState::ClientDown);
        actions![]
    }

    pub(super) fn handle_station_list(
        &mut self,
        source: StationAddr,
        frame: StationListFrame,
    ) -> TdmaActionIterator<'_> {
        let joining = self.joins_implicitly(source);
        if !(self.state.is_client_running() || joining) || self.master != Some(source) {
            return self.discard("STATION_LIST");
        }

        match frame.entry(self.config.station_address).copied() {
            None if joining => self.discard("STATION_LIST"),
            None => {
                log::warn!("Removed from the station list of {}", source);
                self.leave_cycle();
                actions![]
            }
            Some(entry) => {
                if !self.apply_parameters(&frame.params) {
                    log::warn!("Ignoring invalid cycle parameters from {}", source);
                    return self.discard("STATION_LIST");
                }
                self.own_offset = Some(Duration::from_nanos(i64::from(entry.offset_ns)));
                if joining {
                    actions![self.join_cycle(source)]
                } else {
                    actions![]
                }
            }
        }
    }

    pub(super) fn handle_change_offset(
        &mut self,
        source: StationAddr,
        frame: ChangeOffsetFrame,
    ) -> TdmaActionIterator<'_> {
        if !self.state.is_client_running() || self.master != Some(source) {
            return self.discard("REQUEST_CHANGE_OFFSET");
        }

        let own_offset = Duration::from_nanos(i64::from(frame.offset_ns));
        log::info!("Transmit slot moved to offset {}", own_offset);
        self.own_offset = Some(own_offset);
        actions![]
    }

    /// Map the 16 bit cycle number of a SYNC onto the local counter.
    ///
    /// The first SYNC after joining adopts the numbering of the master, unless
    /// that would move the counter back. Returns `None` for cycles that were
    /// already released, so released cycle numbers never repeat or decrease.
    pub(super) fn extend_cycle_no(&mut self, wire: u16) -> Option<u64> {
        let expected = self.cycle_no;

        let cycle_no = if self.clock_model.last_sync().is_none() {
            let candidate = unwrap_cycle_no(wire, expected);
            self.cycle_no_shift = expected.saturating_sub(candidate);
            candidate + self.cycle_no_shift
        } else {
            let reference = expected.saturating_sub(self.cycle_no_shift);
            let cycle_no = unwrap_cycle_no(wire, reference) + self.cycle_no_shift;
            if cycle_no < expected {
                return None;
            }
            cycle_no
        };

        self.cycle_no = cycle_no + 1;
        Some(cycle_no)
    }

    /// A SYNC of the followed master starts a cycle
    pub(super) fn handle_sync(&mut self, sync: ReceivedSync) -> TdmaActionIterator<'_> {
        let joined = if self.joins_implicitly(sync.source) {
            log::info!("{} runs its cycle without us having seen ACK_ACK_CONF", sync.source);
            Some(self.join_cycle(sync.source))
        } else {
            None
        };
        if !self.state.is_client_running() || self.master != Some(sync.source) {
            return self.discard("START_OF_FRAME");
        }

        let Some(cycle_no) = self.extend_cycle_no(sync.frame.cycle_no) else {
            log::debug!(
                "Cycle {} of {} was already released",
                sync.frame.cycle_no,
                sync.source
            );
            return match joined {
                Some(cancel) => actions![cancel],
                None => self.discard("START_OF_FRAME"),
            };
        };
        let cycle_start = self.clock_model.absorb_sync(SyncSample {
            cycle_no,
            xmit_stamp: Time::from_nanos(sync.frame.xmit_stamp),
            sched_xmit_stamp: Time::from_nanos(sync.frame.sched_xmit_stamp),
            receive_time: sync.timestamp,
        });
        self.scheduler
            .synchronize(cycle_start, self.clock_model.drift());

        let release = TdmaAction::ReleaseCycle {
            info: CycleInfo {
                cycle_no,
                cycle_start,
                clock_offset: self.clock_model.offset(),
            },
        };

        // One calibration request per cycle until calibrated, the reply of
        // the previous one is expected before the next SYNC
        self.clock_model.calibration_lost();
        if self.clock_model.wants_calibration_request() {
            let xmit_stamp = self.clock.now().wire_nanos();
            self.clock_model.calibration_requested(xmit_stamp);
            let frame = Frame::calibration_request(xmit_stamp, cycle_no.wrapping_add(1) as u16);
            let destination = Destination::Station(sync.source);
            match joined {
                Some(cancel) => self.send_frame(&frame, destination, [cancel, release]),
                None => self.send_frame(&frame, destination, [release]),
            }
        } else {
            match joined {
                Some(cancel) => actions![cancel, release],
                None => actions![release],
            }
        }
    }

    pub(super) fn handle_calibration_reply(
        &mut self,
        source: StationAddr,
        reply: CalibrationReply,
        timestamp: Time,
    ) -> TdmaActionIterator<'_> {
        if !self.state.is_client_running() || self.master != Some(source) {
            return self.discard("CAL_RPL");
        }

        let sample = CalibrationSample {
            t1: Time::from_nanos(reply.request_xmit_stamp),
            t2: Time::from_nanos(reply.reception_stamp),
            t3: Time::from_nanos(reply.xmit_stamp),
            t4: timestamp,
        };
        if self.clock_model.absorb_calibration(sample).is_some() && self.clock_model.is_calibrated()
        {
            log::info!(
                "Calibrated against {}: offset {}, packet delay {}",
                source,
                self.clock_model.offset(),
                self.clock_model.packet_delay()
            );
        }

        actions![]
    }

    /// The client tick fires when the SYNC of a cycle did not arrive within
    /// the grace window
    pub(super) fn client_tick(&mut self) -> TdmaActionIterator<'_> {
        let now = self.clock.now();
        let Some(Tick::Missed {
            predicted_start,
            consecutive,
        }) = self.scheduler.tick(now)
        else {
            return actions![];
        };

        self.clock_model.calibration_lost();

        if consecutive >= self.config.max_missed_cycles {
            log::warn!("Lost the master after {} cycles without SYNC", consecutive);
            self.leave_cycle();
            return actions![];
        }

        let cycle_no = self.cycle_no;
        self.cycle_no += 1;

        actions![TdmaAction::ReleaseCycle {
            info: CycleInfo {
                cycle_no,
                cycle_start: predicted_start,
                clock_offset: self.clock_model.predicted_offset(u64::from(consecutive)),
            },
        }]
    }

    /// Stop following the master and wait for a new CONF
    fn leave_cycle(&mut self) {
        self.scheduler.stop();
        self.clock_model.reset();
        self.master = None;
        self.own_offset = None;
        self.set_state(TdmaState::ClientDown);
    }
}

/// Extend a 16 bit cycle number to the value closest to `reference`
fn unwrap_cycle_no(wire: u16, reference: u64) -> u64 {
    let mut candidate = (reference & !0xffff) | u64::from(wire);
    if candidate.saturating_add(0x8000) < reference {
        candidate += 0x1_0000;
    } else if candidate > reference.saturating_add(0x8000) && candidate >= 0x1_0000 {
        candidate -= 0x1_0000;
    }
    candidate
}
