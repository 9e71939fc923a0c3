use std::net::SocketAddr;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Result, bail};
use clap::Parser;
use glam::Quat;

use replica::{
    Client, ClientConfig, LossyTransport, MessageRegistry, NetworkId, PeerIdentity, PrefabRef,
    RegistryError, SessionConfig, SessionEvent, Transport, TransformSync, UdpTransport,
};
use replica_demo::{Chat, Ping};

#[derive(Parser)]
#[command(name = "replica-client")]
#[command(about = "Replication client")]
struct Args {
    #[arg(
        short,
        long,
        default_value = "127.0.0.1:27015",
        help = "Host address to connect to"
    )]
    server: String,

    #[arg(long, default_value = "0.0.0.0:0", help = "Local address to bind")]
    bind: String,

    #[arg(long, help = "Stable identity (hex); random when omitted")]
    identity: Option<String>,

    #[arg(long, help = "Chat line to send once in sync")]
    say: Option<String>,

    #[arg(long, default_value_t = 5, help = "Seconds between peer pings (0 disables)")]
    ping_interval: u64,

    #[arg(long, default_value_t = 0.0, help = "Outgoing packet loss percentage (0-100)")]
    loss_percent: f32,

    #[arg(long, help = "Disconnect after this many seconds")]
    duration: Option<u64>,
}

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();
    let mut client = start(&args, replica_demo::registry)?;

    let result = run(&mut client, &args);
    client.disconnect();
    result
}

/// Builds the registry, then binds the local socket and starts the handshake.
fn start(
    args: &Args,
    registry: impl FnOnce() -> Result<MessageRegistry, RegistryError>,
) -> Result<Client<LossyTransport<UdpTransport>>> {
    let registry = registry()?;
    let server: SocketAddr = args.server.parse()?;

    let mut session = SessionConfig::default();
    if let Some(identity) = &args.identity {
        session.identity = PeerIdentity(u64::from_str_radix(identity, 16)?);
    }
    let config = ClientConfig {
        session,
        ..Default::default()
    };
    let seed = config.session.identity.get();
    let transport = LossyTransport::new(UdpTransport::bind(&args.bind)?, args.loss_percent, seed);

    Ok(Client::connect(
        transport,
        server,
        config,
        registry,
        replica_demo::prefabs(),
        replica_demo::scenes(),
    ))
}

fn run<T: Transport>(client: &mut Client<T>, args: &Args) -> Result<()> {
    let started = Instant::now();
    let mut last_frame = started;
    let mut last_ping = started;
    let mut nonce = 0u32;
    let mut player: Option<NetworkId> = None;
    let mut greeted = false;

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

        client.pump(delta)?;
        for event in client.drain_events() {
            match event {
                SessionEvent::Connected { host } => {
                    log::info!("Connected to host {}", host);
                }
                SessionEvent::ConnectionDenied { reason } => {
                    bail!("connection denied: {reason}");
                }
                SessionEvent::Disconnected { reason } => {
                    log::info!("Session ended: {}", reason.as_str());
                    return Ok(());
                }
                SessionEvent::SceneLoaded { scene } => {
                    log::info!("Loaded {}", scene);
                    if !greeted {
                        if let Some(text) = &args.say {
                            client.broadcast(&Chat { text: text.clone() })?;
                        }
                        greeted = true;
                    }
                }
                SessionEvent::LocalOwnershipEstablished { network_id } => {
                    let is_player = client
                        .object(network_id)
                        .is_some_and(|object| object.prefab() == PrefabRef::Player);
                    if is_player {
                        log::info!("Controlling player {}", network_id);
                        player = Some(network_id);
                    }
                }
                SessionEvent::ObjectDestroyed { network_id } if player == Some(network_id) => {
                    player = None;
                }
                SessionEvent::Message { from, message } => {
                    if let Some(chat) = message.downcast_ref::<Chat>() {
                        log::info!("<{}> {}", from, chat.text);
                    } else if let Some(ping) = message.downcast_ref::<Ping>() {
                        log::info!("ping {} from {}", ping.nonce, from);
                    }
                }
                other => log::debug!("{:?}", other),
            }
        }

        if client.is_synced() {
            if let Some(id) = player {
                steer(client, id, started.elapsed().as_secs_f32());
            }

            let interval = Duration::from_secs(args.ping_interval);
            if args.ping_interval > 0 && last_ping.elapsed() >= interval {
                nonce = nonce.wrapping_add(1);
                client.broadcast(&Ping { nonce })?;
                last_ping = Instant::now();
            }
        }

        thread::sleep(Duration::from_millis(1));
    }
}

fn steer<T: Transport>(client: &mut Client<T>, player: NetworkId, seconds: f32) {
    if let Some((_, transform)) = client
        .object_mut(player)
        .and_then(|object| object.find_mut::<TransformSync>())
    {
        transform.set(
            replica_demo::orbit(seconds + 2.0, 2.0),
            Quat::from_rotation_y(-seconds),
        );
    }
}
