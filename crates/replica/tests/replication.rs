use std::any::Any;
use std::thread;
use std::time::{Duration, Instant};

use glam::{Quat, Vec3};
use replica::{
    AnyMessage, Client, ClientConfig, ClientState, DisconnectReason, Host, HostConfig, HostState,
    IdSpace, LoadedScene, LossyTransport, MemoryNetwork, MemoryTransport, Message,
    MessageRegistry, NetworkId, PeerIdentity, PrefabRef, PrefabTable, Reliability,
    ReplicatedBehaviour, ReplicatedObject, Routing, SceneIndex, SceneLoaded, SceneLoader,
    SceneObject, Scope, SessionConfig, SessionError, SessionEvent, Spawn, StaticScenes,
    Transport, TransformSync, TransformUpdate, WireError, WireReader, WireWriter,
};

const STEP: Duration = Duration::from_millis(35);
const HOST_ID: PeerIdentity = PeerIdentity(1);

#[derive(Debug, Clone, PartialEq)]
struct ChatLine {
    seq: u32,
    text: String,
}

impl Message for ChatLine {
    const NAME: &'static str = "test.ChatLine";

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.seq);
        writer.write_str(&self.text);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            seq: reader.read_u32()?,
            text: reader.read_string()?,
        })
    }
}

#[derive(Debug, Clone, PartialEq)]
struct HostNote(u32);

impl Message for HostNote {
    const NAME: &'static str = "test.HostNote";
    const SCOPE: Scope = Scope::HOST_ONLY;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.0);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(reader.read_u32()?))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct ClientNote(u32);

impl Message for ClientNote {
    const NAME: &'static str = "test.ClientNote";
    const SCOPE: Scope = Scope::CLIENT_ONLY;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.0);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(reader.read_u32()?))
    }
}

#[derive(Debug, Clone, PartialEq)]
struct DirectPing(u32);

impl Message for DirectPing {
    const NAME: &'static str = "test.DirectPing";
    const ROUTING: Routing = Routing::PeerToPeer;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.0);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self(reader.read_u32()?))
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Count {
    value: u32,
    snapshot: bool,
}

impl Message for Count {
    const NAME: &'static str = "test.Count";
    const RELIABILITY: Reliability = Reliability::Unreliable;

    fn encode(&self, writer: &mut WireWriter) {
        writer.write_u32(self.value);
        writer.write_bool(self.snapshot);
    }

    fn decode(reader: &mut WireReader<'_>) -> Result<Self, WireError> {
        Ok(Self {
            value: reader.read_u32()?,
            snapshot: reader.read_bool()?,
        })
    }
}

/// Counts up on the owner and keeps every message a replica applied, in
/// order.
#[derive(Debug, Default)]
struct Counter {
    value: u32,
    changed: bool,
    applied: Vec<Count>,
}

impl Counter {
    fn bump(&mut self) {
        self.value += 1;
        self.changed = true;
    }
}

impl ReplicatedBehaviour for Counter {
    fn produce_snapshot(&self) -> Vec<Box<dyn AnyMessage>> {
        vec![Box::new(Count {
            value: self.value,
            snapshot: true,
        })]
    }

    fn apply_update(&mut self, message: &dyn AnyMessage) -> bool {
        let Some(count) = message.downcast_ref::<Count>() else {
            return false;
        };
        self.value = count.value;
        self.applied.push(*count);
        true
    }

    fn produce_updates(&mut self) -> Vec<Box<dyn AnyMessage>> {
        if !self.changed {
            return Vec::new();
        }
        self.changed = false;
        vec![Box::new(Count {
            value: self.value,
            snapshot: false,
        })]
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// Finishes scene 0 at once and never finishes any other scene.
#[derive(Debug, Default)]
struct StuckLoader {
    pending: Option<SceneIndex>,
}

impl SceneLoader for StuckLoader {
    fn begin_load(&mut self, scene: SceneIndex) {
        self.pending = Some(scene);
    }

    fn poll_loaded(&mut self) -> Option<LoadedScene> {
        match self.pending {
            Some(SceneIndex(0)) => {
                self.pending = None;
                Some(LoadedScene {
                    index: SceneIndex(0),
                    objects: vec![SceneObject {
                        id: NetworkId(1),
                        template: 0,
                    }],
                })
            }
            _ => None,
        }
    }
}

fn registry() -> MessageRegistry {
    MessageRegistry::builder()
        .behaviour_message::<TransformUpdate>()
        .behaviour_message::<Count>()
        .message::<ChatLine>()
        .message::<HostNote>()
        .message::<ClientNote>()
        .message::<DirectPing>()
        .build()
        .unwrap()
}

fn transform() -> Vec<Box<dyn ReplicatedBehaviour>> {
    vec![Box::new(TransformSync::default())]
}

fn prefabs() -> PrefabTable {
    PrefabTable::new()
        .with_player(transform)
        .with_prefab("crate", transform)
        .with_prefab("counter", || vec![Box::new(Counter::default())])
}

fn scenes(latency: u32) -> StaticScenes {
    StaticScenes::new()
        .with_scene(
            SceneIndex(0),
            vec![SceneObject {
                id: NetworkId(1),
                template: 0,
            }],
        )
        .with_scene(SceneIndex(1), Vec::new())
        .with_latency(latency)
}

fn session_config(identity: u64) -> SessionConfig {
    SessionConfig {
        identity: PeerIdentity(identity),
        resend_interval_ms: 20,
        heartbeat_interval_ms: 50,
        ..SessionConfig::default()
    }
}

fn host_config() -> HostConfig {
    HostConfig {
        session: session_config(HOST_ID.get()),
        max_peers: 8,
    }
}

fn client_config(identity: u64) -> ClientConfig {
    ClientConfig {
        session: session_config(identity),
        handshake_retry_ms: 20,
    }
}

fn start_host<T: Transport>(transport: T, config: HostConfig) -> Host<T> {
    let mut host = Host::new(transport, config, registry(), prefabs(), scenes(0));
    host.load_scene(SceneIndex(0));
    host
}

fn start_client<T: Transport>(transport: T, host: &Host<impl Transport>, identity: u64) -> Client<T> {
    Client::connect(
        transport,
        host.local_addr(),
        client_config(identity),
        registry(),
        prefabs(),
        scenes(0),
    )
}

fn position(object: Option<&ReplicatedObject>) -> Option<Vec3> {
    object?
        .find::<TransformSync>()
        .map(|(_, transform)| transform.position())
}

fn move_to(object: Option<&mut ReplicatedObject>, to: Vec3) {
    let (_, transform) = object.unwrap().find_mut::<TransformSync>().unwrap();
    transform.set(to, Quat::from_rotation_y(0.5));
}

fn messages<M: Message>(events: &[SessionEvent]) -> Vec<(PeerIdentity, &M)> {
    events
        .iter()
        .filter_map(|event| match event {
            SessionEvent::Message { from, message } => {
                message.downcast_ref::<M>().map(|m| (*from, m))
            }
            _ => None,
        })
        .collect()
}

struct Cluster<T> {
    host: Host<T>,
    host_events: Vec<SessionEvent>,
    clients: Vec<Client<T>>,
    client_events: Vec<Vec<SessionEvent>>,
}

impl<T: Transport> Cluster<T> {
    fn new(host: Host<T>) -> Self {
        Self {
            host,
            host_events: Vec::new(),
            clients: Vec::new(),
            client_events: Vec::new(),
        }
    }

    fn join(&mut self, client: Client<T>) -> usize {
        self.clients.push(client);
        self.client_events.push(Vec::new());
        self.clients.len() - 1
    }

    fn round(&mut self) {
        let all: Vec<usize> = (0..self.clients.len()).collect();
        self.round_only(&all);
    }

    fn round_only(&mut self, active: &[usize]) {
        self.host.pump(STEP).unwrap();
        self.host_events.extend(self.host.drain_events());
        for &index in active {
            self.clients[index].pump(STEP).unwrap();
            let events = self.clients[index].drain_events();
            self.client_events[index].extend(events);
        }
    }

    fn rounds(&mut self, count: usize) {
        for _ in 0..count {
            self.round();
        }
    }

    fn run_until(&mut self, max_rounds: usize, done: impl Fn(&Self) -> bool) -> bool {
        for _ in 0..max_rounds {
            if done(self) {
                return true;
            }
            self.round();
        }
        done(self)
    }

    fn all_synced(&self) -> bool {
        self.clients.iter().all(Client::is_synced)
            && self.host.peers().all(|peer| peer.is_synced())
    }
}

fn memory_cluster(network: &MemoryNetwork, clients: &[u64]) -> Cluster<MemoryTransport> {
    let mut cluster = Cluster::new(start_host(network.bind(), host_config()));
    for &identity in clients {
        let client = start_client(network.bind(), &cluster.host, identity);
        cluster.join(client);
    }
    assert!(cluster.run_until(50, Cluster::all_synced));
    cluster
}

#[test]
fn late_joiner_receives_current_state() {
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(network.bind(), host_config()));
    assert_eq!(cluster.host.state(), HostState::SceneStable);
    assert_eq!(cluster.host.player(), Some(NetworkId(-1)));

    let crate_id = cluster
        .host
        .spawn(PrefabRef::Networked(0), IdSpace::Scene, HOST_ID)
        .unwrap();
    assert_eq!(crate_id, NetworkId(2));
    move_to(cluster.host.object_mut(crate_id), Vec3::new(4.0, 0.0, -2.0));
    cluster.rounds(3);

    let client = start_client(network.bind(), &cluster.host, 10);
    let a = cluster.join(client);
    assert!(cluster.run_until(50, |c| c.clients[a].object(crate_id).is_some()
        && c.clients[a].object_ids().len() == 4));

    let replica = &cluster.clients[a];
    assert_eq!(
        replica.object_ids(),
        vec![NetworkId(-1), NetworkId(-2), NetworkId(1), crate_id]
    );
    assert_eq!(
        position(replica.object(crate_id)),
        Some(Vec3::new(4.0, 0.0, -2.0))
    );
    assert_eq!(replica.object(crate_id).unwrap().owner(), Some(HOST_ID));

    let player = replica.object(NetworkId(-2)).unwrap();
    assert!(player.is_locally_owned());
    assert!(cluster.client_events[a].iter().any(|event| matches!(
        event,
        SessionEvent::LocalOwnershipEstablished { network_id } if *network_id == NetworkId(-2)
    )));

    let spawned = cluster.client_events[a]
        .iter()
        .position(|event| matches!(event, SessionEvent::ObjectSpawned { network_id, .. } if *network_id == crate_id));
    assert!(spawned.is_some());
}

#[test]
fn scene_change_waits_for_peers_present_at_the_change() {
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(network.bind(), host_config()));
    for identity in [10, 11] {
        let client = Client::connect(
            network.bind(),
            cluster.host.local_addr(),
            client_config(identity),
            registry(),
            prefabs(),
            scenes(2),
        );
        cluster.join(client);
    }
    assert!(cluster.run_until(50, Cluster::all_synced));
    cluster.host_events.clear();

    cluster.host.load_scene(SceneIndex(1));
    assert_eq!(cluster.host.state(), HostState::AwaitingPeerLoad);
    assert!(!cluster.host.is_simulating());
    let frozen_at = cluster.host.tick();

    let late = start_client(network.bind(), &cluster.host, 12);
    let c = cluster.join(late);
    for _ in 0..50 {
        if cluster.clients[c].is_synced() {
            break;
        }
        cluster.round_only(&[c]);
    }
    assert!(cluster.clients[c].is_synced());
    assert_eq!(cluster.clients[c].scene(), Some(SceneIndex(1)));
    assert!(!cluster.host.is_simulating());
    assert_eq!(cluster.host.tick(), frozen_at);

    assert!(cluster.run_until(50, |c| c.host.is_simulating()));
    assert_eq!(cluster.host.state(), HostState::SceneStable);
    let resumed: Vec<_> = cluster
        .host_events
        .iter()
        .filter(|event| matches!(event, SessionEvent::SimulationResumed { .. }))
        .collect();
    assert_eq!(resumed.len(), 1);

    assert!(cluster.run_until(50, Cluster::all_synced));
    for client in &cluster.clients {
        assert_eq!(client.scene(), Some(SceneIndex(1)));
        assert!(client.object(NetworkId(1)).is_none());
    }

    cluster.rounds(2);
    assert!(cluster.host.tick() > frozen_at);
    let next = cluster
        .host
        .spawn(PrefabRef::Networked(0), IdSpace::Scene, HOST_ID)
        .unwrap();
    assert_eq!(next, NetworkId(1));
}

#[test]
fn scene_change_without_peers_resumes_immediately() {
    let network = MemoryNetwork::new();
    let mut host = start_host(network.bind(), host_config());
    host.drain_events();

    host.load_scene(SceneIndex(1));
    assert!(host.is_simulating());
    assert!(host.drain_events().iter().any(|event| matches!(
        event,
        SessionEvent::SimulationResumed { scene } if *scene == SceneIndex(1)
    )));
}

#[test]
fn scope_filters_application_messages() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10, 11]);
    let a_id = cluster.clients[0].identity();

    cluster.host.broadcast(&ClientNote(1)).unwrap();
    cluster.clients[0].broadcast(&HostNote(2)).unwrap();
    cluster.clients[0].broadcast(&ClientNote(3)).unwrap();
    cluster.rounds(10);

    let host_heard: Vec<u32> = messages::<HostNote>(&cluster.host_events)
        .into_iter()
        .map(|(from, note)| {
            assert_eq!(from, a_id);
            note.0
        })
        .collect();
    assert_eq!(host_heard, vec![2]);
    assert!(messages::<ClientNote>(&cluster.host_events).is_empty());

    assert!(messages::<HostNote>(&cluster.client_events[1]).is_empty());
    let b_heard: Vec<(PeerIdentity, u32)> = messages::<ClientNote>(&cluster.client_events[1])
        .into_iter()
        .map(|(from, note)| (from, note.0))
        .collect();
    assert_eq!(b_heard, vec![(HOST_ID, 1), (a_id, 3)]);

    let a_heard: Vec<u32> = messages::<ClientNote>(&cluster.client_events[0])
        .into_iter()
        .map(|(_, note)| note.0)
        .collect();
    assert_eq!(a_heard, vec![1]);
}

#[test]
fn owner_transform_reaches_host_and_peers() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10, 11]);
    let a_player = NetworkId(-2);
    assert!(cluster.run_until(20, |c| c.clients[1].object(a_player).is_some()));

    let target = Vec3::new(1.5, 0.0, 7.0);
    move_to(cluster.clients[0].object_mut(a_player), target);

    assert!(cluster.run_until(30, |c| {
        position(c.host.object(a_player)) == Some(target)
            && position(c.clients[1].object(a_player)) == Some(target)
    }));
}

#[test]
fn non_owner_cannot_act_on_foreign_objects() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10, 11]);
    let a_player = NetworkId(-2);
    assert!(cluster.run_until(20, |c| c.clients[1].object(a_player).is_some()));

    let update = TransformUpdate {
        position: Vec3::splat(99.0),
        rotation: Quat::IDENTITY,
    };
    assert!(matches!(
        cluster.clients[1].send_update(a_player, 0, Box::new(update)),
        Err(SessionError::NotOwner { .. })
    ));
    assert!(matches!(
        cluster.clients[1].destroy(a_player),
        Err(SessionError::NotOwner { .. })
    ));
    assert!(matches!(
        cluster.host.destroy(a_player),
        Err(SessionError::NotOwner { .. })
    ));
}

#[test]
fn owner_destroy_is_announced() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10, 11]);
    let b_player = NetworkId(-3);
    assert!(cluster.run_until(20, |c| c.clients[0].object(b_player).is_some()));

    cluster.clients[1].destroy(b_player).unwrap();
    assert!(cluster.clients[1].object(b_player).is_none());
    assert!(cluster.run_until(20, |c| c.host.object(b_player).is_none()
        && c.clients[0].object(b_player).is_none()));
}

#[test]
fn disconnect_destroys_owned_objects() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10, 11]);
    let a_id = cluster.clients[0].identity();
    let a_player = NetworkId(-2);
    assert!(cluster.run_until(20, |c| c.clients[1].object(a_player).is_some()
        && c.clients[1].direct_peers().count() == 1));

    cluster.clients[0].disconnect();
    assert_eq!(cluster.clients[0].state(), ClientState::Disconnected);
    assert!(cluster.clients[0].object_ids().is_empty());

    assert!(cluster.run_until(20, |c| c.clients[1].object(a_player).is_none()));
    assert!(cluster.host.object(a_player).is_none());
    assert!(cluster.host_events.iter().any(|event| matches!(
        event,
        SessionEvent::PeerDisconnected { identity, reason: DisconnectReason::Graceful } if *identity == a_id
    )));
    assert!(cluster.run_until(20, |c| c.clients[1].direct_peers().count() == 0));
    assert_eq!(cluster.host.peers().count(), 1);
}

#[test]
fn kicked_peer_is_told_and_removed() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10]);
    let a_id = cluster.clients[0].identity();

    assert!(cluster.host.kick(a_id));
    assert!(!cluster.host.kick(a_id));
    cluster.rounds(2);

    assert_eq!(cluster.clients[0].state(), ClientState::Disconnected);
    assert!(cluster.host.object(NetworkId(-2)).is_none());
    assert!(cluster.host_events.iter().any(|event| matches!(
        event,
        SessionEvent::PeerDisconnected { reason: DisconnectReason::Kicked, .. }
    )));
}

#[test]
fn silent_peer_times_out() {
    let network = MemoryNetwork::new();
    let mut config = host_config();
    config.session.timeout_ms = 150;
    let mut host = start_host(network.bind(), config);
    let mut client = start_client(network.bind(), &host, 10);

    let start = Instant::now();
    while !client.is_synced() && start.elapsed() < Duration::from_secs(2) {
        host.pump(STEP).unwrap();
        client.pump(STEP).unwrap();
    }
    assert!(client.is_synced());
    host.drain_events();

    let start = Instant::now();
    let mut timed_out = false;
    while !timed_out && start.elapsed() < Duration::from_secs(2) {
        host.pump(STEP).unwrap();
        timed_out = host.drain_events().iter().any(|event| matches!(
            event,
            SessionEvent::PeerDisconnected { reason: DisconnectReason::Timeout, .. }
        ));
        thread::sleep(Duration::from_millis(10));
    }
    assert!(timed_out);
    assert_eq!(host.peers().count(), 0);
    assert!(host.object(NetworkId(-2)).is_none());
}

#[test]
fn client_gives_up_on_silent_host() {
    let network = MemoryNetwork::new();
    let mut host = start_host(network.bind(), host_config());
    let mut config = client_config(10);
    config.session.timeout_ms = 150;
    let mut client = Client::connect(
        network.bind(),
        host.local_addr(),
        config,
        registry(),
        prefabs(),
        scenes(0),
    );

    for _ in 0..20 {
        host.pump(STEP).unwrap();
        client.pump(STEP).unwrap();
    }
    assert!(client.is_synced());
    client.drain_events();

    let start = Instant::now();
    while client.state() != ClientState::Disconnected && start.elapsed() < Duration::from_secs(2) {
        client.pump(STEP).unwrap();
        thread::sleep(Duration::from_millis(10));
    }
    assert_eq!(client.state(), ClientState::Disconnected);
    assert!(client.object_ids().is_empty());
    assert!(client.drain_events().iter().any(|event| matches!(
        event,
        SessionEvent::Disconnected { reason: DisconnectReason::Timeout }
    )));
}

#[test]
fn reconnect_from_new_address_keeps_player() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10]);
    let old_addr = cluster.clients[0].local_addr();

    let replacement = start_client(network.bind(), &cluster.host, 10);
    let new_addr = replacement.local_addr();
    assert_ne!(old_addr, new_addr);
    cluster.clients[0] = replacement;
    cluster.client_events[0].clear();

    assert!(cluster.run_until(50, |c| c.clients[0].is_synced()
        && c.clients[0].object(NetworkId(-2)).is_some()));

    assert_eq!(cluster.host.peers().count(), 1);
    assert_eq!(cluster.host.peers().next().map(|peer| peer.addr), Some(new_addr));
    assert!(cluster.host.object(NetworkId(-3)).is_none());
    assert!(cluster.host_events.iter().any(|event| matches!(
        event,
        SessionEvent::PeerReconnected { addr, .. } if *addr == new_addr
    )));
    assert!(cluster.clients[0].object(NetworkId(-2)).unwrap().is_locally_owned());
}

#[test]
fn mismatched_registry_is_denied() {
    let network = MemoryNetwork::new();
    let mut host = start_host(network.bind(), host_config());
    let stale = MessageRegistry::builder()
        .behaviour_message::<TransformUpdate>()
        .message::<ChatLine>()
        .build()
        .unwrap();
    let mut client = Client::connect(
        network.bind(),
        host.local_addr(),
        client_config(10),
        stale,
        prefabs(),
        scenes(0),
    );

    for _ in 0..5 {
        host.pump(STEP).unwrap();
        client.pump(STEP).unwrap();
    }
    assert_eq!(client.state(), ClientState::Disconnected);
    assert_eq!(host.peers().count(), 0);
    assert!(client.drain_events().iter().any(|event| matches!(
        event,
        SessionEvent::ConnectionDenied { reason } if reason.contains("registry")
    )));
}

#[test]
fn host_denies_past_capacity() {
    let network = MemoryNetwork::new();
    let mut config = host_config();
    config.max_peers = 1;
    let mut cluster = Cluster::new(start_host(network.bind(), config));
    let first = start_client(network.bind(), &cluster.host, 10);
    cluster.join(first);
    let second = start_client(network.bind(), &cluster.host, 11);
    cluster.join(second);

    cluster.rounds(10);
    assert!(cluster.clients[0].is_synced());
    assert_eq!(cluster.clients[1].state(), ClientState::Disconnected);
    assert!(cluster.client_events[1].iter().any(|event| matches!(
        event,
        SessionEvent::ConnectionDenied { reason } if reason == "Server full"
    )));
}

#[test]
fn peer_to_peer_messages_skip_the_relay() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10, 11]);
    let a_id = cluster.clients[0].identity();
    assert!(cluster.run_until(20, |c| c.clients.iter().all(|client| client.direct_peers().count() == 1)));

    cluster.clients[0].broadcast(&DirectPing(7)).unwrap();
    cluster.rounds(6);

    let b_heard = messages::<DirectPing>(&cluster.client_events[1]);
    assert_eq!(b_heard.len(), 1);
    assert_eq!(b_heard[0].0, a_id);
    assert_eq!(b_heard[0].1, &DirectPing(7));
    assert_eq!(messages::<DirectPing>(&cluster.host_events).len(), 1);

    let b_id = cluster.clients[1].identity();
    cluster.clients[0].send_to(b_id, &ChatLine { seq: 1, text: "psst".into() }).unwrap();
    cluster.rounds(4);
    let lines = messages::<ChatLine>(&cluster.client_events[1]);
    assert_eq!(lines.len(), 1);
    assert_eq!(lines[0].0, a_id);
    assert!(messages::<ChatLine>(&cluster.host_events).is_empty());

    assert!(matches!(
        cluster.clients[0].send_to(PeerIdentity(999), &DirectPing(1)),
        Err(SessionError::UnknownPeer(_))
    ));
}

#[test]
fn reliable_messages_survive_packet_loss() {
    let _ = env_logger::builder().is_test(true).try_init();
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(
        LossyTransport::new(network.bind(), 30.0, 11),
        host_config(),
    ));
    let client = Client::connect(
        LossyTransport::new(network.bind(), 30.0, 29),
        cluster.host.local_addr(),
        client_config(10),
        registry(),
        prefabs(),
        scenes(0),
    );
    cluster.join(client);

    let start = Instant::now();
    while !cluster.all_synced() && start.elapsed() < Duration::from_secs(5) {
        cluster.round();
        thread::sleep(Duration::from_millis(2));
    }
    assert!(cluster.all_synced());

    for seq in 0..20 {
        cluster
            .host
            .broadcast(&ChatLine {
                seq,
                text: format!("line {seq}"),
            })
            .unwrap();
    }

    let start = Instant::now();
    while messages::<ChatLine>(&cluster.client_events[0]).len() < 20
        && start.elapsed() < Duration::from_secs(5)
    {
        cluster.round();
        thread::sleep(Duration::from_millis(2));
    }

    let received: Vec<u32> = messages::<ChatLine>(&cluster.client_events[0])
        .into_iter()
        .map(|(_, line)| line.seq)
        .collect();
    assert_eq!(received, (0..20).collect::<Vec<_>>());
    assert!(cluster.host.transport().dropped() > 0);
    assert!(cluster.host.stats().resends > 0);
}

#[test]
fn late_joiner_gets_snapshot_before_live_updates() {
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(network.bind(), host_config()));
    let counter = cluster
        .host
        .spawn(PrefabRef::Networked(1), IdSpace::Scene, HOST_ID)
        .unwrap();
    let bump = |host: &mut Host<MemoryTransport>| {
        let (_, counter) = host
            .object_mut(counter)
            .and_then(|object| object.find_mut::<Counter>())
            .unwrap();
        counter.bump();
    };
    bump(&mut cluster.host);
    cluster.rounds(2);

    let client = start_client(network.bind(), &cluster.host, 10);
    let a = cluster.join(client);
    for _ in 0..40 {
        bump(&mut cluster.host);
        cluster.round();
    }
    cluster.rounds(5);

    let (_, replica) = cluster.clients[a]
        .object(counter)
        .and_then(|object| object.find::<Counter>())
        .unwrap();
    let (_, source) = cluster
        .host
        .object(counter)
        .and_then(|object| object.find::<Counter>())
        .unwrap();

    assert!(replica.applied.len() > 1);
    assert!(replica.applied[0].snapshot);
    assert!(replica.applied[0].value >= 1);
    assert!(replica.applied[1..].iter().all(|count| !count.snapshot));
    assert!(replica.applied.windows(2).all(|pair| pair[0].value <= pair[1].value));
    assert_eq!(replica.value, source.value);
}

#[test]
fn wrong_scene_confirmation_keeps_peer_loading() {
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(network.bind(), host_config()));
    let client = Client::connect(
        network.bind(),
        cluster.host.local_addr(),
        client_config(10),
        registry(),
        prefabs(),
        StuckLoader::default(),
    );
    cluster.join(client);
    assert!(cluster.run_until(50, Cluster::all_synced));
    let a_id = cluster.clients[0].identity();
    let host_id = cluster.clients[0].host().unwrap();

    cluster.host.load_scene(SceneIndex(1));
    cluster.rounds(3);
    assert_eq!(cluster.clients[0].state(), ClientState::Loading(SceneIndex(1)));

    cluster.clients[0]
        .send_to(host_id, &SceneLoaded { scene: SceneIndex(0) })
        .unwrap();
    cluster.rounds(5);
    assert_eq!(cluster.host.state(), HostState::AwaitingPeerLoad);
    assert!(!cluster.host.is_simulating());
    assert!(cluster.host.peer(a_id).unwrap().is_loading());

    cluster.clients[0]
        .send_to(host_id, &SceneLoaded { scene: SceneIndex(1) })
        .unwrap();
    assert!(cluster.run_until(10, |c| c.host.is_simulating()));
    assert!(cluster.host.peer(a_id).unwrap().is_synced());
}

#[test]
fn repeated_spawn_keeps_or_replaces_by_prefab() {
    let network = MemoryNetwork::new();
    let mut cluster = memory_cluster(&network, &[10]);
    let a_id = cluster.clients[0].identity();
    let crate_id = cluster
        .host
        .spawn(PrefabRef::Networked(0), IdSpace::Scene, HOST_ID)
        .unwrap();
    let target = Vec3::new(2.0, 0.0, 3.0);
    move_to(cluster.host.object_mut(crate_id), target);
    assert!(cluster.run_until(20, |c| position(c.clients[0].object(crate_id)) == Some(target)));

    let same = Spawn {
        network_id: crate_id,
        prefab: PrefabRef::Networked(0),
        owner: HOST_ID,
    };
    let spawns = |c: &Cluster<MemoryTransport>| {
        c.client_events[0]
            .iter()
            .filter(|event| matches!(
                event,
                SessionEvent::ObjectSpawned { network_id, .. } if *network_id == crate_id
            ))
            .count()
    };
    assert_eq!(spawns(&cluster), 1);

    cluster.host.send_to(a_id, &same).unwrap();
    cluster.rounds(3);
    assert_eq!(spawns(&cluster), 1);
    assert_eq!(position(cluster.clients[0].object(crate_id)), Some(target));

    let other = Spawn {
        prefab: PrefabRef::Networked(1),
        ..same
    };
    cluster.host.send_to(a_id, &other).unwrap();
    cluster.rounds(3);
    assert_eq!(spawns(&cluster), 2);
    let replaced = cluster.clients[0].object(crate_id).unwrap();
    assert_eq!(replaced.prefab(), PrefabRef::Networked(1));
    assert!(replaced.find::<Counter>().is_some());
    assert!(replaced.find::<TransformSync>().is_none());
}

#[test]
fn persistent_destroy_reaches_loading_peers() {
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(network.bind(), host_config()));
    for identity in [10, 11] {
        let client = Client::connect(
            network.bind(),
            cluster.host.local_addr(),
            client_config(identity),
            registry(),
            prefabs(),
            scenes(2),
        );
        cluster.join(client);
    }
    assert!(cluster.run_until(50, Cluster::all_synced));
    let b_player = NetworkId(-3);
    assert!(cluster.run_until(20, |c| c.clients[0].object(b_player).is_some()));

    cluster.host.load_scene(SceneIndex(1));
    cluster.clients[1].disconnect();
    for _ in 0..60 {
        cluster.round_only(&[0]);
    }

    assert!(cluster.host.object(b_player).is_none());
    assert!(cluster.host.is_simulating());
    assert!(cluster.clients[0].is_synced());
    assert_eq!(cluster.clients[0].scene(), Some(SceneIndex(1)));
    assert!(cluster.clients[0].object(b_player).is_none());
    assert!(cluster.clients[0].object(NetworkId(-2)).is_some());
    assert!(cluster.clients[0].object(NetworkId(-1)).is_some());
}

#[test]
fn lost_transform_updates_are_repaired() {
    let network = MemoryNetwork::new();
    let mut cluster = Cluster::new(start_host(
        LossyTransport::new(network.bind(), 0.0, 3),
        host_config(),
    ));
    let crate_id = cluster
        .host
        .spawn(PrefabRef::Networked(0), IdSpace::Scene, HOST_ID)
        .unwrap();
    let client = Client::connect(
        LossyTransport::new(network.bind(), 0.0, 5),
        cluster.host.local_addr(),
        client_config(10),
        registry(),
        prefabs(),
        scenes(0),
    );
    cluster.join(client);
    assert!(cluster.run_until(50, |c| c.all_synced() && c.clients[0].object(crate_id).is_some()));
    cluster.rounds(10);

    let target = Vec3::new(5.0, 0.0, 5.0);
    move_to(cluster.host.object_mut(crate_id), target);
    cluster.host.transport_mut().set_loss(100.0);
    cluster.rounds(8);
    assert_eq!(position(cluster.clients[0].object(crate_id)), Some(Vec3::ZERO));
    assert!(cluster.host.transport().dropped() > 0);

    cluster.host.transport_mut().set_loss(0.0);
    assert!(cluster.run_until(100, |c| position(c.clients[0].object(crate_id)) == Some(target)));
}
