//! The event loop driving one TDMA instance
//!
//! Everything that reaches the instance (received frames, control requests
//! and application frames) goes through a single queue and is handled one at
//! a time. Between events the loop sleeps until the instance timer, the next
//! cycle tick or the next transmit slot, whichever comes first.

use std::{collections::VecDeque, sync::Arc};

use arrayvec::ArrayVec;
use rand::{rngs::StdRng, SeedableRng};
use rtmac::{
    config::{StationAddr, StationKind},
    datastructures::frames::RTMAC_ETHERTYPE,
    discipline::{Discipline, RxOutcome, TxPolicy},
    scheduler::{CycleInfo, WaitKind},
    tdma::{Destination, RequestError, TdmaAction, TdmaActionIterator, TdmaState, TimerId},
    time::{Duration, Time},
    Clock,
};
use thiserror::Error;
use tokio::{
    sync::{mpsc, oneshot, watch},
    task::JoinHandle,
    time::Instant,
};

use crate::{
    clock::LinuxClock,
    config::{Config, StartupRole, StationConfig},
    control::{ControlError, ControlRequest, ControlResponse},
    network::{Envelope, PacketIo},
};

const EVENT_QUEUE_LEN: usize = 256;
const TX_QUEUE_LEN: usize = 64;
const UPPER_QUEUE_LEN: usize = 256;

/// What tasks waiting on the cycle are told
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CycleSignal {
    Idle,
    Released(CycleInfo),
    /// The instance was taken down
    Stopped,
}

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitError {
    #[error("the TDMA instance was taken down while waiting")]
    Stopped,
}

#[derive(Debug)]
enum RuntimeEvent {
    Frame {
        envelope: Envelope,
        timestamp: Time,
    },
    Control {
        request: ControlRequest,
        reply: oneshot::Sender<ControlResponse>,
    },
    Transmit(Envelope),
    Shutdown,
}

/// The owned form of a [`TdmaAction`], so the instance is free again while
/// the action is performed
#[derive(Debug)]
enum Effect {
    Send {
        destination: Destination,
        data: Vec<u8>,
    },
    ResetTimer {
        timer: TimerId,
        duration: std::time::Duration,
    },
    CancelTimer,
    Release(CycleInfo),
}

fn into_effects(actions: TdmaActionIterator<'_>) -> ArrayVec<Effect, 3> {
    actions
        .map(|action| match action {
            TdmaAction::SendFrame { destination, data } => Effect::Send {
                destination,
                data: data.to_vec(),
            },
            TdmaAction::ResetTimer { timer, duration } => Effect::ResetTimer { timer, duration },
            TdmaAction::CancelTimer => Effect::CancelTimer,
            TdmaAction::ReleaseCycle { info } => Effect::Release(info),
        })
        .collect()
}

fn micros(us: u64) -> Duration {
    Duration::from_micros(i64::try_from(us).unwrap_or(i64::MAX))
}

fn station_kind(rt: bool) -> StationKind {
    if rt {
        StationKind::Rt
    } else {
        StationKind::Nrt
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

/// Handle to a running instance
#[derive(Debug, Clone)]
pub struct InstanceHandle {
    events: mpsc::Sender<RuntimeEvent>,
    cycles: watch::Receiver<CycleSignal>,
    slots: watch::Receiver<CycleSignal>,
}

impl InstanceHandle {
    /// Run a control request to completion
    pub async fn request(&self, request: ControlRequest) -> Result<ControlResponse, ControlError> {
        if let ControlRequest::WaitOnCycle { kind } = request {
            return Ok(match self.wait_on_cycle(kind).await {
                Ok(info) => info.into(),
                Err(error) => ControlResponse::Failed {
                    message: error.to_string(),
                },
            });
        }

        let (reply, response) = oneshot::channel();
        self.events
            .send(RuntimeEvent::Control { request, reply })
            .await
            .map_err(|_| ControlError::Stopped)?;
        response.await.map_err(|_| ControlError::Stopped)
    }

    /// Block until the next cycle starts ([`WaitKind::Default`]) or the next
    /// transmit slot of this station begins ([`WaitKind::Xmit`])
    pub async fn wait_on_cycle(&self, kind: WaitKind) -> Result<CycleInfo, WaitError> {
        let mut receiver = match kind {
            WaitKind::Default => self.cycles.clone(),
            WaitKind::Xmit => self.slots.clone(),
        };
        receiver.borrow_and_update();

        loop {
            receiver.changed().await.map_err(|_| WaitError::Stopped)?;
            let signal = *receiver.borrow_and_update();
            match signal {
                CycleSignal::Released(info) => return Ok(info),
                CycleSignal::Stopped => return Err(WaitError::Stopped),
                CycleSignal::Idle => continue,
            }
        }
    }

    /// Hand an application frame to the discipline
    pub async fn transmit(
        &self,
        destination: StationAddr,
        ethertype: u16,
        payload: Vec<u8>,
    ) -> Result<(), ControlError> {
        // The source is filled in by the runtime
        let envelope = Envelope {
            destination,
            source: StationAddr::default(),
            ethertype,
            payload,
        };
        self.events
            .send(RuntimeEvent::Transmit(envelope))
            .await
            .map_err(|_| ControlError::Stopped)
    }

    /// Detach the discipline and stop the event loop
    pub async fn shutdown(&self) -> Result<(), ControlError> {
        self.events
            .send(RuntimeEvent::Shutdown)
            .await
            .map_err(|_| ControlError::Stopped)
    }
}

pub struct Runtime<P> {
    discipline: Discipline<LinuxClock, StdRng>,
    clock: LinuxClock,
    address: StationAddr,
    role: StartupRole,
    io: Arc<P>,
    events: mpsc::Receiver<RuntimeEvent>,
    events_sender: mpsc::Sender<RuntimeEvent>,
    timer: Option<(TimerId, Instant)>,
    slots: VecDeque<(Time, CycleInfo)>,
    cycles: watch::Sender<CycleSignal>,
    slot_signal: watch::Sender<CycleSignal>,
    tx_queue: VecDeque<Envelope>,
    upper: mpsc::Sender<Envelope>,
    configured_stations: VecDeque<StationConfig>,
}

impl<P: PacketIo> Runtime<P> {
    /// Attach TDMA for the station described by `config` to `io`.
    ///
    /// Frames under other ethertypes are delivered to the returned receiver.
    pub fn new(config: &Config, io: P) -> (Self, InstanceHandle, mpsc::Receiver<Envelope>) {
        let clock = LinuxClock::new();
        let (events_sender, events) = mpsc::channel(EVENT_QUEUE_LEN);
        let (cycles, cycles_receiver) = watch::channel(CycleSignal::Idle);
        let (slot_signal, slots_receiver) = watch::channel(CycleSignal::Idle);
        let (upper, upper_receiver) = mpsc::channel(UPPER_QUEUE_LEN);

        let runtime = Runtime {
            discipline: Discipline::attach(config.tdma_config(), clock, StdRng::from_entropy()),
            clock,
            address: config.station_address,
            role: config.role,
            io: Arc::new(io),
            events,
            events_sender: events_sender.clone(),
            timer: None,
            slots: VecDeque::new(),
            cycles,
            slot_signal,
            tx_queue: VecDeque::new(),
            upper,
            configured_stations: config.stations.iter().copied().collect(),
        };

        let handle = InstanceHandle {
            events: events_sender,
            cycles: cycles_receiver,
            slots: slots_receiver,
        };

        (runtime, handle, upper_receiver)
    }

    pub async fn run(mut self) {
        let receiver = tokio::spawn(receive_frames(
            self.io.clone(),
            self.clock,
            self.events_sender.clone(),
        ));

        self.start().await;

        loop {
            let timer = self.timer.map(|(_, deadline)| deadline);
            let tick = self
                .discipline
                .instance()
                .and_then(|instance| instance.next_tick())
                .map(|tick| self.clock.instant_of(tick));
            let slot = self
                .slots
                .front()
                .map(|(start, _)| self.clock.instant_of(*start));

            tokio::select! {
                event = self.events.recv() => match event {
                    Some(RuntimeEvent::Shutdown) | None => break,
                    Some(event) => self.handle_event(event).await,
                },
                () = sleep_until(timer) => self.handle_timer().await,
                () = sleep_until(tick) => self.handle_tick().await,
                () = sleep_until(slot) => self.release_slot().await,
            }

            self.admit_configured_stations().await;
        }

        self.shutdown(receiver).await;
    }

    async fn start(&mut self) {
        let requests: &[ControlRequest] = match self.role {
            StartupRole::Master => &[
                ControlRequest::BecomeMaster {
                    cycle_period_us: None,
                },
                ControlRequest::Up,
            ],
            StartupRole::Client => &[ControlRequest::BecomeClient],
            StartupRole::None => &[],
        };

        for request in requests {
            if let ControlResponse::Rejected { error } = self.control(*request).await {
                tracing::error!("Could not take the {:?} role: {}", self.role, error);
                return;
            }
        }
    }

    async fn handle_event(&mut self, event: RuntimeEvent) {
        match event {
            RuntimeEvent::Frame {
                envelope,
                timestamp,
            } => self.receive(envelope, timestamp).await,
            RuntimeEvent::Control { request, reply } => {
                let response = self.control(request).await;
                if reply.send(response).is_err() {
                    tracing::debug!("Control client went away before the response");
                }
            }
            RuntimeEvent::Transmit(envelope) => self.transmit(envelope).await,
            RuntimeEvent::Shutdown => {}
        }
    }

    async fn receive(&mut self, envelope: Envelope, timestamp: Time) {
        tracing::trace!(
            "Received {:#06x} from {}: {}",
            envelope.ethertype,
            envelope.source,
            hex::encode(&envelope.payload)
        );

        let effects = match self.discipline.rx(
            envelope.ethertype,
            &envelope.payload,
            envelope.source,
            timestamp,
        ) {
            RxOutcome::Consumed(actions) => Some(into_effects(actions)),
            RxOutcome::Pass => None,
        };

        match effects {
            Some(effects) => self.perform(effects).await,
            None => {
                if self.upper.try_send(envelope).is_err() {
                    tracing::debug!("Upper layer is not keeping up, dropping frame");
                }
            }
        }
    }

    async fn control(&mut self, request: ControlRequest) -> ControlResponse {
        let Some(instance) = self.discipline.instance_mut() else {
            return ControlResponse::Failed {
                message: "TDMA is not attached".into(),
            };
        };

        let result = match request {
            ControlRequest::BecomeMaster { cycle_period_us } => instance
                .become_master(cycle_period_us.map(micros))
                .map(into_effects),
            ControlRequest::BecomeClient => instance.become_client().map(into_effects),
            ControlRequest::Up => instance.up().map(into_effects),
            ControlRequest::Down => Ok(into_effects(instance.down())),
            ControlRequest::AddStation {
                address,
                rt,
                offset_us,
            } => instance
                .add_station(address, station_kind(rt), micros(offset_us))
                .map(into_effects),
            ControlRequest::RemoveStation { address, rt } => instance
                .remove_station(address, station_kind(rt))
                .map(into_effects),
            ControlRequest::ChangeCycle { cycle_period_us } => instance
                .change_cycle(micros(cycle_period_us))
                .map(into_effects),
            ControlRequest::ChangeOffset { address, offset_us } => instance
                .change_offset(address, micros(offset_us))
                .map(into_effects),
            ControlRequest::ChangeMtu { mtu } => instance.change_mtu(mtu).map(into_effects),
            ControlRequest::TimeOffset => {
                return ControlResponse::TimeOffset {
                    offset_ns: instance.time_offset(),
                }
            }
            ControlRequest::Snapshot => return ControlResponse::Snapshot(instance.snapshot()),
            ControlRequest::WaitOnCycle { .. } => {
                return ControlResponse::Failed {
                    message: "waiting is handled by the instance handle".into(),
                }
            }
        };

        match result {
            Ok(effects) => {
                self.perform(effects).await;
                if request == ControlRequest::Down {
                    self.stop_waiters();
                }
                ControlResponse::Done
            }
            Err(error) => ControlResponse::Rejected { error },
        }
    }

    async fn handle_timer(&mut self) {
        let Some((timer, _)) = self.timer.take() else {
            return;
        };
        let Some(instance) = self.discipline.instance_mut() else {
            return;
        };

        let effects = into_effects(instance.handle_timer(timer));
        self.perform(effects).await;
    }

    async fn handle_tick(&mut self) {
        let Some(instance) = self.discipline.instance_mut() else {
            return;
        };

        let effects = into_effects(instance.handle_tick());
        self.perform(effects).await;
    }

    async fn transmit(&mut self, mut envelope: Envelope) {
        envelope.source = self.address;

        match self.discipline.tx_policy() {
            TxPolicy::Immediate => self.send(&envelope).await,
            TxPolicy::OwnSlot if self.tx_queue.len() < TX_QUEUE_LEN => {
                self.tx_queue.push_back(envelope)
            }
            TxPolicy::OwnSlot => tracing::warn!("Transmit queue is full, dropping frame"),
            TxPolicy::Drop => tracing::debug!("Not part of a cycle, dropping frame"),
        }
    }

    async fn release_slot(&mut self) {
        let Some((_, info)) = self.slots.pop_front() else {
            return;
        };

        self.slot_signal.send_replace(CycleSignal::Released(info));

        while let Some(envelope) = self.tx_queue.pop_front() {
            self.send(&envelope).await;
        }
    }

    /// Admit the stations from the configuration file, one at a time, once
    /// this station runs as master
    async fn admit_configured_stations(&mut self) {
        let Some(station) = self.configured_stations.front().copied() else {
            return;
        };
        let Some(instance) = self.discipline.instance_mut() else {
            return;
        };
        if instance.state() != TdmaState::MasterRunning || instance.snapshot().pending.is_some() {
            return;
        }

        let result = instance
            .add_station(station.address, station.kind, station.offset())
            .map(into_effects);

        match result {
            Ok(effects) => {
                self.configured_stations.pop_front();
                self.perform(effects).await;
            }
            Err(RequestError::AlreadyInProgress) => {}
            Err(error) => {
                tracing::warn!("Could not admit station {}: {}", station.address, error);
                self.configured_stations.pop_front();
            }
        }
    }

    async fn perform(&mut self, effects: ArrayVec<Effect, 3>) {
        for effect in effects {
            match effect {
                Effect::Send { destination, data } => {
                    let envelope = Envelope {
                        destination: destination.address(),
                        source: self.address,
                        ethertype: RTMAC_ETHERTYPE,
                        payload: data,
                    };
                    self.send(&envelope).await;
                }
                Effect::ResetTimer { timer, duration } => {
                    self.timer = Some((timer, Instant::now() + duration));
                }
                Effect::CancelTimer => self.timer = None,
                Effect::Release(info) => self.release_cycle(info),
            }
        }
    }

    async fn send(&self, envelope: &Envelope) {
        if let Err(error) = self.io.send(envelope).await {
            tracing::error!("Could not send frame to {}: {}", envelope.destination, error);
        }
    }

    fn release_cycle(&mut self, info: CycleInfo) {
        tracing::trace!("Cycle {} started at {}", info.cycle_no, info.cycle_start);
        self.cycles.send_replace(CycleSignal::Released(info));

        for offset in self.discipline.tx_slots() {
            let start = info.cycle_start + offset;
            let index = self.slots.partition_point(|(other, _)| *other <= start);
            self.slots.insert(index, (start, info));
        }
    }

    fn stop_waiters(&mut self) {
        self.slots.clear();
        self.tx_queue.clear();
        self.cycles.send_replace(CycleSignal::Stopped);
        self.slot_signal.send_replace(CycleSignal::Stopped);
    }

    async fn shutdown(&mut self, receiver: JoinHandle<()>) {
        receiver.abort();

        let effects = into_effects(self.discipline.detach());
        self.perform(effects).await;
        self.timer = None;
        self.stop_waiters();
    }
}

async fn receive_frames<P: PacketIo>(
    io: Arc<P>,
    clock: LinuxClock,
    events: mpsc::Sender<RuntimeEvent>,
) {
    loop {
        match io.recv().await {
            Ok(envelope) => {
                let timestamp = clock.now();
                if events
                    .send(RuntimeEvent::Frame {
                        envelope,
                        timestamp,
                    })
                    .await
                    .is_err()
                {
                    break;
                }
            }
            Err(error) => {
                tracing::error!("Could not receive frames: {}", error);
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration as StdDuration;

    use rtmac::tdma::AdmissionPhase;

    use super::*;
    use crate::network::MemorySegment;

    const MASTER: StationAddr = StationAddr([2, 0, 0, 0, 0, 1]);
    const CLIENT: StationAddr = StationAddr([2, 0, 0, 0, 0, 2]);
    const OTHER_ETHERTYPE: u16 = 0x88b5;

    fn config(text: &str) -> Config {
        let config: Config = toml::from_str(text).unwrap();
        assert!(config.check());
        config
    }

    fn master_config() -> Config {
        config(
            r#"
station-address = "02:00:00:00:00:01"
role = "master"
[tdma]
cycle-period-us = 20000
master-wait-cycles = 2
admission-timeout-ms = 100
retry-backoff-ms = 50
calibration-rounds = 4
master-slots-us = [0]
[[station]]
address = "02:00:00:00:00:02"
kind = "rt"
offset-us = 5000
"#,
        )
    }

    fn client_config() -> Config {
        config(
            r#"
station-address = "02:00:00:00:00:02"
role = "client"
[tdma]
cycle-period-us = 20000
admission-timeout-ms = 100
calibration-rounds = 4
"#,
        )
    }

    async fn snapshot(handle: &InstanceHandle) -> rtmac::observability::TdmaSnapshot {
        match handle.request(ControlRequest::Snapshot).await.unwrap() {
            ControlResponse::Snapshot(snapshot) => snapshot,
            other => panic!("unexpected response {other:?}"),
        }
    }

    async fn wait_for_calibrated_client(handle: &InstanceHandle) {
        for _ in 0..500 {
            let snapshot = snapshot(handle).await;
            if snapshot.state == TdmaState::ClientRunning && snapshot.calibrated {
                return;
            }
            tokio::time::sleep(StdDuration::from_millis(10)).await;
        }
        panic!("client did not join the cycle");
    }

    struct Segment {
        master: InstanceHandle,
        client: InstanceHandle,
        client_upper: mpsc::Receiver<Envelope>,
    }

    fn start_segment() -> Segment {
        let segment = MemorySegment::new();

        let (master, master_handle, _) =
            Runtime::new(&master_config(), segment.attach(MASTER));
        let (client, client_handle, client_upper) =
            Runtime::new(&client_config(), segment.attach(CLIENT));

        tokio::spawn(master.run());
        tokio::spawn(client.run());

        Segment {
            master: master_handle,
            client: client_handle,
            client_upper,
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn client_joins_configured_master() {
        let segment = start_segment();
        wait_for_calibrated_client(&segment.client).await;

        let master = snapshot(&segment.master).await;
        assert_eq!(master.state, TdmaState::MasterRunning);
        assert!(master
            .stations
            .iter()
            .any(|station| station.address == CLIENT && station.phase == AdmissionPhase::Client));

        let client = snapshot(&segment.client).await;
        assert_eq!(client.master, Some(MASTER));
        assert_eq!(client.own_offset_ns, Some(5_000_000));

        // Both stations read the same clock
        let offset = match segment.client.request(ControlRequest::TimeOffset).await {
            Ok(ControlResponse::TimeOffset { offset_ns }) => offset_ns,
            other => panic!("unexpected response {other:?}"),
        };
        assert!(offset.abs() < 5_000_000, "offset {offset}");
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiters_see_increasing_cycles() {
        let segment = start_segment();
        wait_for_calibrated_client(&segment.client).await;

        let first = segment
            .client
            .wait_on_cycle(WaitKind::Default)
            .await
            .unwrap();
        let second = segment
            .client
            .wait_on_cycle(WaitKind::Default)
            .await
            .unwrap();
        assert!(second.cycle_no > first.cycle_no);
        assert!(second.cycle_start > first.cycle_start);

        let slot = segment.client.wait_on_cycle(WaitKind::Xmit).await.unwrap();
        assert!(slot.cycle_no >= second.cycle_no);

        let master_slot = segment.master.wait_on_cycle(WaitKind::Xmit).await.unwrap();
        assert!(master_slot.cycle_no > 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn requests_are_answered() {
        let segment = start_segment();
        wait_for_calibrated_client(&segment.client).await;

        let response = segment
            .master
            .request(ControlRequest::AddStation {
                address: MASTER,
                rt: true,
                offset_us: 1000,
            })
            .await
            .unwrap();
        assert_eq!(
            response,
            ControlResponse::Rejected {
                error: RequestError::OwnAddress
            }
        );

        let response = segment
            .client
            .request(ControlRequest::ChangeMtu { mtu: 1000 })
            .await
            .unwrap();
        assert_eq!(
            response,
            ControlResponse::Rejected {
                error: RequestError::WrongRole
            }
        );

        let response = segment
            .master
            .request(ControlRequest::ChangeMtu { mtu: 1000 })
            .await
            .unwrap();
        assert_eq!(response, ControlResponse::Done);
        assert_eq!(snapshot(&segment.master).await.mtu, 1000);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn other_traffic_passes_through() {
        let mut segment = start_segment();
        wait_for_calibrated_client(&segment.client).await;

        segment
            .master
            .transmit(CLIENT, OTHER_ETHERTYPE, vec![1, 2, 3])
            .await
            .unwrap();

        let received = tokio::time::timeout(StdDuration::from_secs(1), segment.client_upper.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(received.source, MASTER);
        assert_eq!(received.ethertype, OTHER_ETHERTYPE);
        assert_eq!(received.payload, vec![1, 2, 3]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn waiters_are_released_on_shutdown() {
        let segment = start_segment();
        wait_for_calibrated_client(&segment.client).await;

        let response = segment.client.request(ControlRequest::Down).await.unwrap();
        assert_eq!(response, ControlResponse::Done);
        assert_eq!(snapshot(&segment.client).await.state, TdmaState::Down);

        let waiter = segment.client.clone();
        let wait = tokio::spawn(async move { waiter.wait_on_cycle(WaitKind::Default).await });
        tokio::time::sleep(StdDuration::from_millis(50)).await;

        segment.client.shutdown().await.unwrap();
        assert_eq!(wait.await.unwrap(), Err(WaitError::Stopped));
        assert!(matches!(
            segment.client.request(ControlRequest::Snapshot).await,
            Err(ControlError::Stopped)
        ));
    }
}
