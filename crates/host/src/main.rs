use std::thread;
use std::time::{Duration, Instant};

use anyhow::Result;
use clap::Parser;
use glam::Quat;

use replica::{
    Host, HostConfig, IdSpace, LossyTransport, MessageRegistry, PrefabRef, RegistryError,
    SessionConfig, SessionEvent, Transport, TransformSync, UdpTransport,
};
use replica_demo::{ARENA, BEACON, Beacon, Chat, LOBBY, Ping};

#[derive(Parser)]
#[command(name = "replica-host")]
#[command(about = "Authoritative replication host")]
struct Args {
    #[arg(short, long, default_value = "0.0.0.0")]
    bind: String,

    #[arg(short, long, default_value_t = replica::DEFAULT_PORT)]
    port: u16,

    #[arg(short, long, default_value_t = replica::DEFAULT_TICK_RATE)]
    tick_rate: u32,

    #[arg(short, long, default_value_t = 32)]
    max_peers: usize,

    #[arg(long, default_value_t = 10_000, help = "Drop peers silent for this long (ms)")]
    timeout_ms: u64,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(
        long,
        default_value_t = 30,
        help = "Seconds between lobby/arena switches (0 disables)"
    )]
    scene_cycle: u64,

    #[arg(long, help = "Exit after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut host = start(&args, replica_demo::registry)?;
    log::info!("Host {} started on {}", host.identity(), host.local_addr());
    host.load_scene(LOBBY);

    run(&mut host, &args)?;

    log::info!("Host shutting down");
    host.shutdown();
    Ok(())
}

/// Builds the registry, then binds the listen socket.
fn start(
    args: &Args,
    registry: impl FnOnce() -> Result<MessageRegistry, RegistryError>,
) -> Result<Host<LossyTransport<UdpTransport>>> {
    let registry = registry()?;
    let bind_addr = format!("{}:{}", args.bind, args.port);

    let config = HostConfig {
        session: SessionConfig {
            tick_rate: args.tick_rate,
            timeout_ms: args.timeout_ms,
            ..Default::default()
        },
        max_peers: args.max_peers,
    };
    let seed = config.session.identity.get();
    let transport = LossyTransport::new(UdpTransport::bind(&bind_addr)?, args.loss_percent, seed);

    Ok(Host::new(
        transport,
        config,
        registry,
        replica_demo::prefabs(),
        replica_demo::scenes(),
    ))
}

fn run<T: Transport>(host: &mut Host<T>, args: &Args) -> Result<()> {
    let started = Instant::now();
    let mut last_frame = started;
    let mut last_switch = started;
    let mut last_report = started;

    loop {
        if args
            .duration
            .is_some_and(|limit| started.elapsed() >= Duration::from_secs(limit))
        {
            return Ok(());
        }

        let now = Instant::now();
        let delta = now - last_frame;
        last_frame = now;

        host.pump(delta)?;
        for event in host.drain_events() {
            handle_event(host, event)?;
        }

        if host.is_simulating() {
            animate(host, started.elapsed().as_secs_f32());

            let cycle = Duration::from_secs(args.scene_cycle);
            if args.scene_cycle > 0 && last_switch.elapsed() >= cycle {
                let next = if host.scene() == Some(LOBBY) { ARENA } else { LOBBY };
                host.load_scene(next);
                last_switch = Instant::now();
            }
        }

        if last_report.elapsed() >= Duration::from_secs(10) {
            let stats = host.stats();
            log::info!(
                "{} peers, tick {}, {} packets out / {} in, {} resends, rtt {:.1}ms",
                host.peers().count(),
                host.tick(),
                stats.packets_sent,
                stats.packets_received,
                stats.resends,
                stats.rtt_ms
            );
            last_report = Instant::now();
        }

        thread::sleep(Duration::from_millis(1));
    }
}

fn handle_event<T: Transport>(host: &mut Host<T>, event: SessionEvent) -> Result<()> {
    match event {
        SessionEvent::PeerConnected { identity, addr } => {
            log::info!("Peer {} connected from {}", identity, addr);
            host.send_to(
                identity,
                &Chat {
                    text: format!("welcome, {identity}"),
                },
            )?;
        }
        SessionEvent::PeerReconnected { identity, addr } => {
            log::info!("Peer {} reconnected from {}", identity, addr);
        }
        SessionEvent::PeerSynced { identity } => {
            log::info!("Peer {} is in sync", identity);
        }
        SessionEvent::PeerDisconnected { identity, reason } => {
            log::info!("Peer {} {}", identity, reason.as_str());
        }
        SessionEvent::SimulationResumed { scene } => {
            log::info!("Simulation resumed in {}", scene);
            if scene == ARENA {
                let owner = host.identity();
                let beacon = host.spawn(PrefabRef::Networked(BEACON), IdSpace::Scene, owner)?;
                log::info!("Spawned beacon {}", beacon);
            }
        }
        SessionEvent::Message { from, message } => {
            if let Some(chat) = message.downcast_ref::<Chat>() {
                log::info!("<{}> {}", from, chat.text);
            } else if let Some(ping) = message.downcast_ref::<Ping>() {
                log::debug!("ping {} from {}", ping.nonce, from);
            }
        }
        other => log::debug!("{:?}", other),
    }
    Ok(())
}

/// Moves the host's player around the origin and recolours its beacons.
fn animate<T: Transport>(host: &mut Host<T>, seconds: f32) {
    if let Some(player) = host.player() {
        if let Some((_, transform)) = host
            .object_mut(player)
            .and_then(|object| object.find_mut::<TransformSync>())
        {
            transform.set(
                replica_demo::orbit(seconds, 4.0),
                Quat::from_rotation_y(seconds),
            );
        }
    }

    let color = (seconds as u32 % 8) * 0x202020;
    for id in host.object_ids() {
        if let Some((_, beacon)) = host
            .object_mut(id)
            .filter(|object| object.is_locally_owned())
            .and_then(|object| object.find_mut::<Beacon>())
        {
            beacon.set_color(color);
        }
    }
}
