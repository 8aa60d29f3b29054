use core::cell::Cell;

use arrayvec::ArrayVec;
use rand::rngs::mock::StepRng;

use super::*;
use crate::{datastructures::frames::FrameId, scheduler::CycleInfo};

const MASTER: StationAddr = StationAddr([2, 0, 0, 0, 0, 1]);
const CLIENT: StationAddr = StationAddr([2, 0, 0, 0, 0, 2]);
const OTHER: StationAddr = StationAddr([2, 0, 0, 0, 0, 3]);

/// One-way delay of every frame
const DELAY_NS: i64 = 10_000;
/// How far the master clock is ahead of the client clock
const SKEW_NS: i64 = 300_000;

struct TestClock {
    now: Cell<Time>,
}

impl TestClock {
    fn new(now: Time) -> Self {
        TestClock {
            now: Cell::new(now),
        }
    }

    fn advance(&self, duration: Duration) {
        self.now.set(self.now.get() + duration);
    }
}

impl Clock for TestClock {
    fn now(&self) -> Time {
        self.now.get()
    }
}

/// Clocks of the stations on a simulated segment. They all run at the same
/// rate, at fixed offsets from each other.
struct Net {
    master_clock: TestClock,
    client_clock: TestClock,
}

impl Net {
    fn new() -> Self {
        let origin = Time::from_secs(10);
        Net {
            master_clock: TestClock::new(origin),
            client_clock: TestClock::new(origin - Duration::from_nanos(SKEW_NS)),
        }
    }

    fn advance(&self, duration: Duration) {
        self.master_clock.advance(duration);
        self.client_clock.advance(duration);
    }
}

type Instance<'a> = TdmaInstance<&'a TestClock, StepRng>;

fn test_config(station_address: StationAddr) -> TdmaConfig {
    TdmaConfig {
        cycle_period: Duration::from_millis(1),
        master_wait_cycles: 2,
        admission_timeout: Duration::from_millis(10),
        max_admission_attempts: 3,
        retry_backoff: Duration::from_millis(20),
        calibration_rounds: 2,
        max_missed_cycles: 3,
        ..TdmaConfig::new(station_address)
    }
}

fn new_instance(clock: &TestClock, station_address: StationAddr) -> Instance<'_> {
    TdmaInstance::new(test_config(station_address), clock, StepRng::new(1000, 7))
}

#[derive(Debug)]
enum Output {
    Send {
        destination: Destination,
        data: ArrayVec<u8, MAX_DATA_LEN>,
    },
    Timer(TimerId, core::time::Duration),
    Cancel,
    Release(CycleInfo),
}

type Outputs = ArrayVec<Output, 3>;

fn outputs(actions: TdmaActionIterator<'_>) -> Outputs {
    actions
        .map(|action| match action {
            TdmaAction::SendFrame { destination, data } => Output::Send {
                destination,
                data: ArrayVec::try_from(data).unwrap(),
            },
            TdmaAction::ResetTimer { timer, duration } => Output::Timer(timer, duration),
            TdmaAction::CancelTimer => Output::Cancel,
            TdmaAction::ReleaseCycle { info } => Output::Release(info),
        })
        .collect()
}

fn sent(outputs: &Outputs) -> Option<(Destination, Frame)> {
    outputs.iter().find_map(|output| match output {
        Output::Send { destination, data } => {
            Some((*destination, Frame::deserialize(data).unwrap()))
        }
        _ => None,
    })
}

fn sent_id(outputs: &Outputs) -> Option<FrameId> {
    sent(outputs).map(|(_, frame)| frame.frame_id())
}

fn timer_of(outputs: &Outputs) -> Option<TimerId> {
    outputs.iter().find_map(|output| match output {
        Output::Timer(timer, _) => Some(*timer),
        _ => None,
    })
}

fn release_of(outputs: &Outputs) -> Option<CycleInfo> {
    outputs.iter().find_map(|output| match output {
        Output::Release(info) => Some(*info),
        _ => None,
    })
}

fn cancels(outputs: &Outputs) -> usize {
    outputs
        .iter()
        .filter(|output| matches!(output, Output::Cancel))
        .count()
}

fn encode(frame: Frame) -> ArrayVec<u8, MAX_DATA_LEN> {
    let mut buffer = [0; MAX_DATA_LEN];
    let length = frame.serialize(&mut buffer).unwrap();
    ArrayVec::try_from(&buffer[..length]).unwrap()
}

/// Pass the frame in `outputs` to `to`, after the path delay
fn deliver(net: &Net, to: &mut Instance<'_>, from: StationAddr, sent: &Outputs) -> Outputs {
    let Some(data) = sent.iter().find_map(|output| match output {
        Output::Send { data, .. } => Some(data),
        _ => None,
    }) else {
        return Outputs::new();
    };

    net.advance(Duration::from_nanos(DELAY_NS));
    let timestamp = to.clock.now();
    outputs(to.handle_receive(data, from, timestamp))
}

/// Walk a master and a client through startup and admission of the client
/// as RT station, stopping as soon as one of them enters `target`
fn walk(net: &Net, target: TdmaState) -> (Instance<'_>, Instance<'_>) {
    let mut master = new_instance(&net.master_clock, MASTER);
    let mut client = new_instance(&net.client_clock, CLIENT);

    macro_rules! check {
        () => {
            if master.state() == target || client.state() == target {
                return (master, client);
            }
        };
    }

    check!();
    outputs(master.become_master(None).unwrap());
    check!();
    let wait = timer_of(&outputs(master.up().unwrap())).unwrap();
    check!();
    outputs(master.handle_timer(wait));
    check!();
    outputs(client.become_client().unwrap());
    check!();

    let conf = outputs(
        master
            .add_station(CLIENT, StationKind::Rt, Duration::from_micros(200))
            .unwrap(),
    );
    check!();
    let ack_conf = deliver(net, &mut client, MASTER, &conf);
    check!();
    let test = deliver(net, &mut master, CLIENT, &ack_conf);
    check!();
    let ack_test = deliver(net, &mut client, MASTER, &test);
    check!();
    let ack_ack_conf = deliver(net, &mut master, CLIENT, &ack_test);
    check!();
    deliver(net, &mut client, MASTER, &ack_ack_conf);
    check!();

    panic!("{} was never reached", target);
}

struct CycleReleases {
    master: CycleInfo,
    client: Option<CycleInfo>,
}

/// Let the master start its next cycle and the client follow it, including
/// the calibration exchange
fn run_cycle(net: &Net, master: &mut Instance<'_>, client: &mut Instance<'_>) -> CycleReleases {
    let deadline = master.next_tick().unwrap();
    let now = net.master_clock.now();
    if deadline > now {
        net.advance(deadline - now);
    }

    let sync = outputs(master.handle_tick());
    assert_eq!(sent_id(&sync), Some(FrameId::Sync));
    let master_release = release_of(&sync).unwrap();

    let received = deliver(net, client, MASTER, &sync);
    if sent_id(&received) == Some(FrameId::CalibrationRequest) {
        let reply = deliver(net, master, CLIENT, &received);
        assert_eq!(sent_id(&reply), Some(FrameId::CalibrationReply));
        assert!(deliver(net, client, MASTER, &reply).is_empty());
    }

    CycleReleases {
        master: master_release,
        client: release_of(&received),
    }
}

#[test]
fn master_startup_and_cycles() {
    let net = Net::new();
    let mut master = new_instance(&net.master_clock, MASTER);

    assert!(master.become_master(None).unwrap().next().is_none());
    assert_eq!(master.role(), Role::Master);
    assert_eq!(master.state(), TdmaState::MasterDown);
    assert_eq!(master.next_tick(), None);

    let up = outputs(master.up().unwrap());
    assert_eq!(master.state(), TdmaState::MasterWait);
    assert!(matches!(
        up.as_slice(),
        [Output::Timer(TimerId { kind: TimerKind::MasterWait, .. }, duration)]
            if *duration == core::time::Duration::from_millis(2)
    ));

    // The cycle already runs while waiting for other masters
    let origin = net.master_clock.now();
    assert_eq!(master.next_tick(), Some(origin));
    let tick = outputs(master.handle_tick());
    let (destination, frame) = sent(&tick).unwrap();
    assert_eq!(destination, Destination::Broadcast);
    match frame.body {
        FrameBody::Sync(sync) => {
            assert_eq!(sync.cycle_no, 0);
            assert_eq!(sync.sched_xmit_stamp, origin.wire_nanos());
        }
        _ => panic!("Expected SYNC"),
    }
    assert_eq!(
        release_of(&tick),
        Some(CycleInfo {
            cycle_no: 0,
            cycle_start: origin,
            clock_offset: Duration::ZERO,
        })
    );

    let wait = timer_of(&up).unwrap();
    assert!(master.handle_timer(wait).next().is_none());
    assert_eq!(master.state(), TdmaState::MasterRunning);
}

#[test]
fn master_sends_one_sync_per_cycle() {
    let net = Net::new();
    let mut master = new_instance(&net.master_clock, MASTER);
    outputs(master.become_master(None).unwrap());
    outputs(master.up().unwrap());

    for expected in 0..1000u64 {
        let deadline = master.next_tick().unwrap();
        net.advance(deadline - net.master_clock.now());

        let tick = outputs(master.handle_tick());
        let Some((_, frame)) = sent(&tick) else {
            panic!("No SYNC for cycle {}", expected);
        };
        match frame.body {
            FrameBody::Sync(sync) => assert_eq!(u64::from(sync.cycle_no), expected),
            _ => panic!("Expected SYNC"),
        }
        assert_eq!(release_of(&tick).unwrap().cycle_no, expected);

        // A second tick in the same cycle does nothing
        assert!(master.handle_tick().next().is_none());
    }

    assert_eq!(master.cycle_no(), 1000);
    assert_eq!(master.snapshot().counters.deadline_misses, 0);
}

#[test]
fn client_admission() {
    let net = Net::new();
    let mut master = new_instance(&net.master_clock, MASTER);
    let mut client = new_instance(&net.client_clock, CLIENT);

    outputs(master.become_master(None).unwrap());
    let wait = timer_of(&outputs(master.up().unwrap())).unwrap();
    outputs(master.handle_timer(wait));
    outputs(client.become_client().unwrap());
    assert_eq!(client.state(), TdmaState::ClientDown);

    let conf = outputs(
        master
            .add_station(CLIENT, StationKind::Rt, Duration::from_micros(200))
            .unwrap(),
    );
    assert_eq!(master.state(), TdmaState::MasterSentConf);
    let (destination, frame) = sent(&conf).unwrap();
    assert_eq!(destination, Destination::Station(CLIENT));
    match frame.body {
        FrameBody::Conf(conf) => {
            assert_eq!(conf.params.cycle_period_ns, 1_000_000);
            assert_eq!(conf.entry(CLIENT).unwrap().offset_ns, 200_000);
        }
        _ => panic!("Expected CONF"),
    }
    assert_eq!(timer_of(&conf).unwrap().kind, TimerKind::MasterSentConf);
    // Not committed before the handshake completes
    assert_eq!(master.stations().count(), 0);

    let ack_conf = deliver(&net, &mut client, MASTER, &conf);
    assert_eq!(client.state(), TdmaState::ClientAckConf);
    assert_eq!(sent_id(&ack_conf), Some(FrameId::AckConf));
    assert_eq!(timer_of(&ack_conf).unwrap().kind, TimerKind::ClientSentAck);

    let test = deliver(&net, &mut master, CLIENT, &ack_conf);
    assert_eq!(master.state(), TdmaState::MasterSentTest);
    assert_eq!(sent_id(&test), Some(FrameId::Test));

    let ack_test = deliver(&net, &mut client, MASTER, &test);
    assert_eq!(client.state(), TdmaState::ClientRcvdAck);
    assert_eq!(sent_id(&ack_test), Some(FrameId::AckTest));

    let ack_ack_conf = deliver(&net, &mut master, CLIENT, &ack_test);
    assert_eq!(master.state(), TdmaState::MasterRunning);
    assert_eq!(sent_id(&ack_ack_conf), Some(FrameId::AckAckConf));
    assert_eq!(cancels(&ack_ack_conf), 1);

    let station = *master.stations().next().unwrap();
    assert_eq!(station.address, CLIENT);
    assert_eq!(station.offset, Duration::from_micros(200));
    assert_eq!(station.phase, AdmissionPhase::Client);
    assert_eq!(station.round_trip, Some(Duration::from_nanos(2 * DELAY_NS)));

    let done = deliver(&net, &mut client, MASTER, &ack_ack_conf);
    assert_eq!(client.state(), TdmaState::ClientRunning);
    assert_eq!(cancels(&done), 1);
    assert_eq!(
        client.transmit_slots().as_slice(),
        &[Duration::from_micros(200)]
    );
    // Waiting for the first SYNC
    assert_eq!(client.next_tick(), None);
}

#[test]
fn client_join_times_out() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientAckConf);
    assert_eq!(master.state(), TdmaState::MasterSentConf);

    // The ACK_CONF gets lost, the client gives up
    let timer = client.timer.unwrap();
    assert_eq!(timer.kind, TimerKind::ClientSentAck);
    assert!(client.handle_timer(timer).next().is_none());
    assert_eq!(client.state(), TdmaState::ClientDown);
    assert_eq!(client.transmit_slots().len(), 0);

    // The master retries later and the client answers the new CONF
    let timer = master.timer.unwrap();
    let retry = outputs(master.handle_timer(timer));
    let add_rt = timer_of(&retry).unwrap();
    assert_eq!(add_rt.kind, TimerKind::AddRt);
    let conf = outputs(master.handle_timer(add_rt));
    assert_eq!(sent_id(&conf), Some(FrameId::Conf));

    let ack_conf = deliver(&net, &mut client, MASTER, &conf);
    assert_eq!(client.state(), TdmaState::ClientAckConf);
    assert_eq!(sent_id(&ack_conf), Some(FrameId::AckConf));
}

#[test]
fn client_follows_and_calibrates() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);

    let first = run_cycle(&net, &mut master, &mut client);
    assert_eq!(first.client.unwrap().cycle_no, first.master.cycle_no);
    assert!(!client.snapshot().calibrated);

    for _ in 0..4 {
        let cycle = run_cycle(&net, &mut master, &mut client);
        let released = cycle.client.unwrap();
        assert_eq!(released.cycle_no, cycle.master.cycle_no);
        assert_eq!(
            released.cycle_start,
            cycle.master.cycle_start - Duration::from_nanos(SKEW_NS)
        );
    }

    let snapshot = client.snapshot();
    assert!(snapshot.calibrated);
    assert_eq!(snapshot.clock_offset_ns, SKEW_NS);
    assert_eq!(snapshot.packet_delay_ns, DELAY_NS);
    assert_eq!(client.time_offset(), SKEW_NS);
    assert_eq!(client.cycle_no(), master.cycle_no());
}

#[test]
fn missed_syncs_drop_the_client() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);

    let mut last = None;
    for _ in 0..3 {
        last = run_cycle(&net, &mut master, &mut client).client;
    }
    let last = last.unwrap();

    // The master goes silent
    for missed in 1..=2u64 {
        let deadline = client.next_tick().unwrap();
        net.advance(deadline - net.client_clock.now());

        let tick = outputs(client.handle_tick());
        let info = release_of(&tick).unwrap();
        assert_eq!(info.cycle_no, last.cycle_no + missed);
        assert_eq!(
            info.cycle_start,
            last.cycle_start + Duration::from_millis(missed as i64)
        );
        assert_eq!(client.state(), TdmaState::ClientRunning);
    }

    let deadline = client.next_tick().unwrap();
    net.advance(deadline - net.client_clock.now());
    assert!(client.handle_tick().next().is_none());
    assert_eq!(client.state(), TdmaState::ClientDown);
    assert_eq!(client.next_tick(), None);

    let snapshot = client.snapshot();
    assert_eq!(snapshot.counters.missed_cycles, 3);
    assert_eq!(snapshot.master, None);
    assert_eq!(snapshot.clock_offset_ns, 0);
}

/// Hand the client a SYNC for `cycle_no`, stamped with the master time
fn sync_for(net: &Net, client: &mut Instance<'_>, cycle_no: u64) -> Outputs {
    let stamp = net.master_clock.now().wire_nanos();
    let sync = encode(Frame::sync(cycle_no, stamp, stamp));
    net.advance(Duration::from_nanos(DELAY_NS));
    let timestamp = net.client_clock.now();
    outputs(client.handle_receive(&sync, MASTER, timestamp))
}

#[test]
fn cycle_numbers_never_decrease() {
    let net = Net::new();
    let (_master, mut client) = walk(&net, TdmaState::ClientRunning);

    // The first SYNC sets the numbering
    let first = sync_for(&net, &mut client, 5);
    assert_eq!(release_of(&first).unwrap().cycle_no, 5);
    assert_eq!(client.cycle_no(), 6);

    // A stale SYNC releases nothing and leaves the counter alone
    assert!(sync_for(&net, &mut client, 2).is_empty());
    assert_eq!(client.cycle_no(), 6);

    let next = sync_for(&net, &mut client, 6);
    assert_eq!(release_of(&next).unwrap().cycle_no, 6);
}

#[test]
fn cycle_numbers_wrap_on_the_wire() {
    let net = Net::new();
    let (_master, mut client) = walk(&net, TdmaState::ClientRunning);
    client.cycle_no = 0xfffe;

    for cycle_no in [0xffff, 0x1_0000, 0x1_0003] {
        let released = release_of(&sync_for(&net, &mut client, cycle_no)).unwrap();
        assert_eq!(released.cycle_no, cycle_no);
    }

    // 0xfff0 on the wire is far in the past
    assert!(sync_for(&net, &mut client, 0xfff0).is_empty());
    assert_eq!(client.cycle_no(), 0x1_0004);
}

#[test]
fn first_sync_never_moves_the_counter_back() {
    let net = Net::new();
    let (_master, mut client) = walk(&net, TdmaState::ClientRunning);
    client.cycle_no = 40;

    // The master restarted its numbering, the local one continues
    for (wire, local) in [(3, 40), (4, 41), (5, 42)] {
        let released = release_of(&sync_for(&net, &mut client, wire)).unwrap();
        assert_eq!(released.cycle_no, local);
    }
    assert!(sync_for(&net, &mut client, 4).is_empty());
}

#[test]
fn duplicate_syncs_are_discarded() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);
    run_cycle(&net, &mut master, &mut client);

    let deadline = master.next_tick().unwrap();
    net.advance(deadline - net.master_clock.now());
    let sync = outputs(master.handle_tick());
    let released = release_of(&deliver(&net, &mut client, MASTER, &sync)).unwrap();
    assert_eq!(released.cycle_no, release_of(&sync).unwrap().cycle_no);

    let offset = client.clock_offset();
    let discarded = client.snapshot().counters.discarded_events;

    // The same SYNC again, delivered later
    assert!(deliver(&net, &mut client, MASTER, &sync).is_empty());
    assert_eq!(client.clock_offset(), offset);
    assert_eq!(client.cycle_no(), released.cycle_no + 1);
    assert_eq!(client.snapshot().counters.discarded_events, discarded + 1);

    let next = run_cycle(&net, &mut master, &mut client);
    assert_eq!(next.client.unwrap().cycle_no, next.master.cycle_no);
}

#[test]
fn late_sync_after_missed_tick_is_discarded() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);
    for _ in 0..2 {
        run_cycle(&net, &mut master, &mut client);
    }

    let deadline = master.next_tick().unwrap();
    net.advance(deadline - net.master_clock.now());
    let sync = outputs(master.handle_tick());
    let master_release = release_of(&sync).unwrap();

    // The SYNC is held up past the grace window
    let deadline = client.next_tick().unwrap();
    net.advance(deadline - net.client_clock.now());
    let missed = release_of(&outputs(client.handle_tick())).unwrap();
    assert_eq!(missed.cycle_no, master_release.cycle_no);

    let late = deliver(&net, &mut client, MASTER, &sync);
    assert!(release_of(&late).is_none());

    for _ in 0..3 {
        let cycle = run_cycle(&net, &mut master, &mut client);
        assert_eq!(cycle.client.unwrap().cycle_no, cycle.master.cycle_no);
    }
}

/// Run the handshake until the master commits the client, and return the
/// ACK_ACK_CONF the master sent
fn commit_without_ack_ack_conf(
    net: &Net,
    master: &mut Instance<'_>,
    client: &mut Instance<'_>,
) -> Outputs {
    outputs(client.become_client().unwrap());
    let conf = outputs(
        master
            .add_station(CLIENT, StationKind::Rt, Duration::from_micros(200))
            .unwrap(),
    );
    let ack_conf = deliver(net, client, MASTER, &conf);
    let test = deliver(net, master, CLIENT, &ack_conf);
    let ack_test = deliver(net, client, MASTER, &test);
    let ack_ack_conf = deliver(net, master, CLIENT, &ack_test);

    assert_eq!(master.stations().count(), 1);
    assert_eq!(client.state(), TdmaState::ClientRcvdAck);
    ack_ack_conf
}

#[test]
fn lost_ack_ack_conf_is_replaced_by_sync() {
    let net = Net::new();
    let mut master = running_master(&net.master_clock);
    let mut client = new_instance(&net.client_clock, CLIENT);
    let ack_ack_conf = commit_without_ack_ack_conf(&net, &mut master, &mut client);
    assert_eq!(sent_id(&ack_ack_conf), Some(FrameId::AckAckConf));

    let cycle = run_cycle(&net, &mut master, &mut client);
    assert_eq!(client.state(), TdmaState::ClientRunning);
    assert_eq!(client.timer, None);
    assert_eq!(cycle.client.unwrap().cycle_no, cycle.master.cycle_no);
    assert_eq!(
        client.transmit_slots().as_slice(),
        &[Duration::from_micros(200)]
    );

    // A late ACK_ACK_CONF changes nothing
    deliver(&net, &mut client, MASTER, &ack_ack_conf);
    assert_eq!(client.state(), TdmaState::ClientRunning);

    let next = run_cycle(&net, &mut master, &mut client);
    assert_eq!(next.client.unwrap().cycle_no, next.master.cycle_no);
}

#[test]
fn lost_ack_ack_conf_is_replaced_by_station_list() {
    let net = Net::new();
    let mut master = running_master(&net.master_clock);
    let mut client = new_instance(&net.client_clock, CLIENT);
    commit_without_ack_ack_conf(&net, &mut master, &mut client);

    let list = outputs(master.change_mtu(1000).unwrap());
    assert_eq!(sent_id(&list), Some(FrameId::StationList));
    let joined = deliver(&net, &mut client, MASTER, &list);
    assert_eq!(cancels(&joined), 1);
    assert_eq!(client.state(), TdmaState::ClientRunning);
    assert_eq!(client.snapshot().mtu, 1000);
}

#[test]
fn conf_from_the_master_restarts_a_running_client() {
    let net = Net::new();
    let (master, mut client) = walk(&net, TdmaState::ClientRunning);

    let conf = Frame::conf(master.cycle_parameters(), master.stations.table(None));
    let now = net.client_clock.now();
    let answer = outputs(client.handle_receive(&encode(conf), MASTER, now));

    assert_eq!(sent_id(&answer), Some(FrameId::AckConf));
    assert_eq!(timer_of(&answer).unwrap().kind, TimerKind::ClientSentAck);
    assert_eq!(client.state(), TdmaState::ClientAckConf);
    assert_eq!(client.next_tick(), None);
}

#[test]
fn down_from_every_state() {
    let states = [
        TdmaState::Down,
        TdmaState::MasterDown,
        TdmaState::MasterWait,
        TdmaState::MasterRunning,
        TdmaState::ClientDown,
        TdmaState::MasterSentConf,
        TdmaState::ClientAckConf,
        TdmaState::MasterSentTest,
        TdmaState::ClientRcvdAck,
        TdmaState::ClientRunning,
    ];

    for state in states {
        let net = Net::new();
        let (mut master, mut client) = walk(&net, state);
        let instance = if master.state() == state {
            &mut master
        } else {
            &mut client
        };
        let cycle_no = instance.cycle_no();

        let down = outputs(instance.down());
        assert!(
            matches!(down.as_slice(), [Output::Cancel]),
            "{}: {:?}",
            state,
            down
        );
        assert_eq!(instance.state(), TdmaState::Down);
        assert_eq!(instance.role(), Role::Unconfigured);
        assert_eq!(instance.next_tick(), None);
        assert_eq!(instance.cycle_no(), cycle_no);

        let snapshot = instance.snapshot();
        assert!(snapshot.stations.is_empty());
        assert_eq!(snapshot.pending, None);
    }

    let net = Net::new();
    let mut master = running_master(&net.master_clock);
    outputs(master.handle_receive(&encode(Frame::sync(0, 1, 1)), OTHER, net.master_clock.now()));
    assert_eq!(master.state(), TdmaState::OtherMaster);
    let down = outputs(master.down());
    assert!(matches!(down.as_slice(), [Output::Cancel]));
    assert_eq!(master.state(), TdmaState::Down);
}

fn running_master(clock: &TestClock) -> Instance<'_> {
    let mut master = new_instance(clock, MASTER);
    outputs(master.become_master(None).unwrap());
    let wait = timer_of(&outputs(master.up().unwrap())).unwrap();
    outputs(master.handle_timer(wait));
    assert_eq!(master.state(), TdmaState::MasterRunning);
    master
}

#[test]
fn stale_timers_are_ignored() {
    let net = Net::new();
    let mut master = new_instance(&net.master_clock, MASTER);
    outputs(master.become_master(None).unwrap());
    let wait = timer_of(&outputs(master.up().unwrap())).unwrap();

    outputs(master.down());
    outputs(master.become_master(None).unwrap());
    let second = timer_of(&outputs(master.up().unwrap())).unwrap();
    assert_ne!(wait, second);

    assert!(master.handle_timer(wait).next().is_none());
    assert_eq!(master.state(), TdmaState::MasterWait);

    outputs(master.handle_timer(second));
    assert_eq!(master.state(), TdmaState::MasterRunning);

    // Expiring twice has no effect either
    assert!(master.handle_timer(second).next().is_none());
    assert_eq!(master.state(), TdmaState::MasterRunning);
}

#[test]
fn admission_timeouts_keep_the_station_list() {
    let net = Net::new();
    let (mut master, _client) = walk(&net, TdmaState::ClientRunning);
    let before: ArrayVec<Station, 4> = master.stations().copied().collect();
    assert_eq!(before.len(), 1);

    let conf = outputs(
        master
            .add_station(OTHER, StationKind::Rt, Duration::from_micros(300))
            .unwrap(),
    );
    let mut timer = timer_of(&conf).unwrap();

    for (attempt, backoff_ms) in [(1, 20), (2, 40)] {
        assert_eq!(master.state(), TdmaState::MasterSentConf);
        let expired = outputs(master.handle_timer(timer));
        assert_eq!(master.state(), TdmaState::MasterRunning);
        assert!(master.stations().copied().eq(before.iter().copied()));

        let retry = timer_of(&expired).unwrap();
        assert_eq!(retry.kind, TimerKind::AddRt);
        assert!(matches!(
            expired.as_slice(),
            [Output::Timer(_, duration)]
                if *duration == core::time::Duration::from_millis(backoff_ms)
        ));

        let pending = master.snapshot().pending.unwrap();
        assert_eq!(pending.address, OTHER);
        assert_eq!(pending.phase, AdmissionPhase::Down);
        assert_eq!(pending.attempt, attempt + 1);

        // Nothing else is admitted while a retry is scheduled
        assert_eq!(
            master
                .add_station(StationAddr([2, 0, 0, 0, 0, 4]), StationKind::Nrt, Duration::ZERO)
                .err(),
            Some(RequestError::AlreadyInProgress)
        );

        let resent = outputs(master.handle_timer(retry));
        assert_eq!(sent_id(&resent), Some(FrameId::Conf));
        timer = timer_of(&resent).unwrap();
    }

    // Third attempt fails as well, the candidate is dropped
    let expired = outputs(master.handle_timer(timer));
    assert!(expired.is_empty());
    assert_eq!(master.state(), TdmaState::MasterRunning);
    assert_eq!(master.snapshot().pending, None);
    assert_eq!(master.snapshot().counters.admission_failures, 3);
    assert!(master.stations().copied().eq(before.iter().copied()));
}

#[test]
fn test_timeout_keeps_the_station_list() {
    let net = Net::new();
    let (mut master, _client) = walk(&net, TdmaState::MasterSentTest);

    let timer = master.timer.unwrap();
    assert_eq!(timer.kind, TimerKind::MasterSentTest);
    outputs(master.handle_timer(timer));

    assert_eq!(master.state(), TdmaState::MasterRunning);
    assert_eq!(master.stations().count(), 0);
}

#[test]
fn mismatched_handshake_frames_are_discarded() {
    let net = Net::new();
    let (mut master, _client) = walk(&net, TdmaState::MasterSentTest);
    let now = net.master_clock.now();

    // Wrong counter
    let pending = master.pending.unwrap();
    let ack_test = Frame::ack_test(
        pending.test_counter.wrapping_add(1),
        pending.test_xmit_stamp,
        1,
        2,
    );
    assert!(master
        .handle_receive(&encode(ack_test), CLIENT, now)
        .next()
        .is_none());

    // Right counter, wrong station
    let ack_test = Frame::ack_test(pending.test_counter, pending.test_xmit_stamp, 1, 2);
    assert!(master
        .handle_receive(&encode(ack_test), OTHER, now)
        .next()
        .is_none());

    assert_eq!(master.state(), TdmaState::MasterSentTest);
    assert_eq!(master.pending.unwrap().phase, AdmissionPhase::SentTest);
    assert_eq!(master.snapshot().counters.discarded_events, 2);
}

#[test]
fn ack_conf_must_echo_the_offer() {
    let net = Net::new();
    let (mut master, _client) = walk(&net, TdmaState::MasterSentConf);

    let wrong_offset = Frame::ack_conf(1_000_000, 100_000);
    assert!(master
        .handle_receive(&encode(wrong_offset), CLIENT, net.master_clock.now())
        .next()
        .is_none());
    assert_eq!(master.state(), TdmaState::MasterSentConf);
}

#[test]
fn masters_detect_each_other() {
    let net = Net::new();
    let mut first = new_instance(&net.master_clock, MASTER);
    let mut second = new_instance(&net.client_clock, OTHER);

    for master in [&mut first, &mut second] {
        outputs(master.become_master(None).unwrap());
        outputs(master.up().unwrap());
    }

    let first_sync = outputs(first.handle_tick());
    let second_sync = outputs(second.handle_tick());

    let notified = deliver(&net, &mut second, MASTER, &first_sync);
    assert_eq!(cancels(&notified), 1);
    deliver(&net, &mut first, OTHER, &second_sync);

    for master in [&mut first, &mut second] {
        assert_eq!(master.state(), TdmaState::OtherMaster);
        assert_eq!(master.next_tick(), None);
        assert_eq!(master.up().err(), Some(RequestError::MasterConflict));
        assert_eq!(
            master.become_master(None).err(),
            Some(RequestError::MasterConflict)
        );
        assert_eq!(
            master
                .add_station(CLIENT, StationKind::Nrt, Duration::ZERO)
                .err(),
            Some(RequestError::MasterConflict)
        );
    }

    outputs(first.down());
    assert!(first.become_master(None).is_ok());
}

#[test]
fn request_rejections() {
    let net = Net::new();
    let mut instance = new_instance(&net.master_clock, MASTER);
    let offset = Duration::from_micros(100);

    assert_eq!(
        instance.add_station(CLIENT, StationKind::Rt, offset).err(),
        Some(RequestError::WrongRole)
    );
    assert_eq!(instance.up().err(), Some(RequestError::WrongRole));
    assert_eq!(
        instance.become_master(Some(Duration::ZERO)).err(),
        Some(RequestError::InvalidCyclePeriod)
    );

    outputs(instance.become_client().unwrap());
    assert_eq!(
        instance.become_master(None).err(),
        Some(RequestError::WrongRole)
    );
    assert!(instance.up().unwrap().next().is_none());
    assert_eq!(
        instance.change_mtu(1000).err(),
        Some(RequestError::WrongRole)
    );
    outputs(instance.down());

    outputs(instance.become_master(None).unwrap());
    outputs(instance.up().unwrap());
    assert_eq!(
        instance.add_station(CLIENT, StationKind::Rt, offset).err(),
        Some(RequestError::WrongState)
    );
    assert_eq!(
        instance.become_client().err(),
        Some(RequestError::WrongRole)
    );

    let wait = instance.timer.unwrap();
    outputs(instance.handle_timer(wait));
    assert_eq!(
        instance.add_station(MASTER, StationKind::Rt, offset).err(),
        Some(RequestError::OwnAddress)
    );
    assert_eq!(
        instance
            .add_station(CLIENT, StationKind::Rt, Duration::from_micros(800))
            .err(),
        Some(RequestError::OffsetOutsideCycle)
    );
    assert_eq!(
        instance
            .add_station(CLIENT, StationKind::Rt, Duration::ZERO)
            .err(),
        Some(RequestError::SlotTaken)
    );
    assert_eq!(
        instance.remove_station(CLIENT, StationKind::Rt).err(),
        Some(RequestError::UnknownStation)
    );
    assert_eq!(instance.change_mtu(32).err(), Some(RequestError::InvalidMtu));
    assert_eq!(
        instance.change_mtu(1501).err(),
        Some(RequestError::InvalidMtu)
    );
    assert_eq!(
        instance.change_offset(CLIENT, offset).err(),
        Some(RequestError::UnknownStation)
    );

    outputs(instance.add_station(CLIENT, StationKind::Rt, offset).unwrap());
    assert_eq!(
        instance.add_station(OTHER, StationKind::Rt, offset).err(),
        Some(RequestError::AlreadyInProgress)
    );
}

#[test]
fn admitted_station_is_a_member() {
    let net = Net::new();
    let (mut master, _client) = walk(&net, TdmaState::ClientRunning);

    assert_eq!(
        master
            .add_station(CLIENT, StationKind::Rt, Duration::from_micros(300))
            .err(),
        Some(RequestError::AlreadyMember)
    );
    assert_eq!(
        master
            .add_station(OTHER, StationKind::Rt, Duration::from_micros(200))
            .err(),
        Some(RequestError::SlotTaken)
    );
}

#[test]
fn nrt_stations_use_the_nrt_window() {
    let net = Net::new();
    let mut master = running_master(&net.master_clock);

    let conf = outputs(
        master
            .add_station(OTHER, StationKind::Nrt, Duration::from_micros(5))
            .unwrap(),
    );
    match sent(&conf).unwrap().1.body {
        FrameBody::Conf(conf) => {
            let entry = conf.entry(OTHER).unwrap();
            assert_eq!(entry.kind, StationKind::Nrt);
            assert_eq!(entry.offset_ns, 750_000);
        }
        _ => panic!("Expected CONF"),
    }
}

#[test]
fn removing_the_candidate_aborts_admission() {
    let net = Net::new();
    let (mut master, _client) = walk(&net, TdmaState::MasterSentConf);

    let removed = outputs(master.remove_station(CLIENT, StationKind::Rt).unwrap());
    assert!(matches!(removed.as_slice(), [Output::Cancel]));
    assert_eq!(master.state(), TdmaState::MasterRunning);
    assert_eq!(master.snapshot().pending, None);
    assert_eq!(master.stations().count(), 0);
}

#[test]
fn removed_client_leaves_the_cycle() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);
    run_cycle(&net, &mut master, &mut client);

    let removed = outputs(master.remove_station(CLIENT, StationKind::Rt).unwrap());
    let (destination, frame) = sent(&removed).unwrap();
    assert_eq!(destination, Destination::Broadcast);
    assert_eq!(frame.frame_id(), FrameId::StationList);
    assert_eq!(master.stations().count(), 0);

    assert!(deliver(&net, &mut client, MASTER, &removed).is_empty());
    assert_eq!(client.state(), TdmaState::ClientDown);
    assert_eq!(client.next_tick(), None);
}

#[test]
fn offset_change_reaches_the_client() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);

    assert_eq!(
        master.change_offset(CLIENT, Duration::ZERO).err(),
        Some(RequestError::SlotTaken)
    );

    let change = outputs(
        master
            .change_offset(CLIENT, Duration::from_micros(400))
            .unwrap(),
    );
    let (destination, _) = sent(&change).unwrap();
    assert_eq!(destination, Destination::Station(CLIENT));
    assert_eq!(
        master.stations().next().unwrap().offset,
        Duration::from_micros(400)
    );

    deliver(&net, &mut client, MASTER, &change);
    assert_eq!(
        client.transmit_slots().as_slice(),
        &[Duration::from_micros(400)]
    );
}

#[test]
fn cycle_and_mtu_changes_are_broadcast() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);
    run_cycle(&net, &mut master, &mut client);

    let change = outputs(master.change_cycle(Duration::from_millis(2)).unwrap());
    assert_eq!(sent_id(&change), Some(FrameId::StationList));
    deliver(&net, &mut client, MASTER, &change);
    assert_eq!(client.cycle_period(), Duration::from_millis(2));
    assert_eq!(client.snapshot().cycle_period_ns, 2_000_000);

    let change = outputs(master.change_mtu(600).unwrap());
    deliver(&net, &mut client, MASTER, &change);
    assert_eq!(client.snapshot().mtu, 600);
    assert_eq!(client.state(), TdmaState::ClientRunning);

    // The RT slot at 200us no longer fits before the NRT window
    assert_eq!(
        master.change_cycle(Duration::from_micros(250)).err(),
        Some(RequestError::OffsetOutsideCycle)
    );
}

#[test]
fn frames_from_strangers_are_discarded() {
    let net = Net::new();
    let (mut master, mut client) = walk(&net, TdmaState::ClientRunning);
    let now = net.client_clock.now();

    // A SYNC from a station other than the master is not followed
    assert!(client
        .handle_receive(&encode(Frame::sync(7, 1, 1)), OTHER, now)
        .next()
        .is_none());
    assert_eq!(client.cycle_no(), 0);

    // Calibration requests are only answered for members
    assert!(master
        .handle_receive(&encode(Frame::calibration_request(5, 1)), OTHER, now)
        .next()
        .is_none());

    // Own frames looped back are ignored without counting
    assert!(client
        .handle_receive(&encode(Frame::sync(7, 1, 1)), CLIENT, now)
        .next()
        .is_none());

    assert_eq!(client.snapshot().counters.discarded_events, 1);
    assert_eq!(master.snapshot().counters.discarded_events, 1);
}

#[test]
fn malformed_frames_are_counted() {
    let net = Net::new();
    let mut master = running_master(&net.master_clock);
    let now = net.master_clock.now();

    let mut foreign = encode(Frame::sync(0, 1, 1));
    foreign[1] = 0x02;
    assert!(master.handle_receive(&foreign, OTHER, now).next().is_none());
    assert!(master.handle_receive(&[0x02], OTHER, now).next().is_none());

    assert_eq!(master.snapshot().counters.malformed_frames, 2);
    assert_eq!(master.state(), TdmaState::MasterRunning);
}
