use clap::Parser;
use rand::Rng;
use server::probe;
use shared::{decode_positions, Message, PlayerUpdate};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about = "Scripted client for poking a running server")]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    /// Reliable handshake port
    #[arg(short = 't', long, default_value = "54321")]
    tcp_port: u16,

    /// Display name to register with
    #[arg(short, long, default_value = "probe")]
    name: String,

    /// Number of updates to send
    #[arg(short, long, default_value = "20")]
    steps: u32,

    /// Delay between updates in milliseconds
    #[arg(short, long, default_value = "100")]
    interval_ms: u64,

    /// Only check that the server answers ping
    #[arg(long)]
    ping: bool,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();
    let server_addr: SocketAddr = format!("{}:{}", args.host, args.tcp_port).parse()?;

    if args.ping {
        let alive = probe::ping(server_addr).await?;
        println!("Server at {} {}", server_addr, if alive { "is up" } else { "did not answer pong" });
        return Ok(());
    }

    let mut registration = probe::register(server_addr, &args.name).await?;
    let client_id = registration.client_id;
    let udp_addr = SocketAddr::new(server_addr.ip(), registration.udp_port);
    println!("Registered as {} with id {}, sending to {}", args.name, client_id, udp_addr);

    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    registration
        .send(&Message::chat(format!("{} joined", args.name)))
        .await?;

    let mut rng = rand::thread_rng();
    let (mut x, mut y) = (0.0f32, 0.0f32);
    let mut buf = [0u8; 2048];

    for step in 0..args.steps {
        // Random walk
        x += rng.gen_range(-5.0..=5.0);
        y += rng.gen_range(-5.0..=5.0);

        let update = PlayerUpdate::position(client_id, x, y);
        probe::send_update(&socket, udp_addr, &update).await?;
        println!("[{}] sent {}", step, update.to_record());

        match timeout(Duration::from_millis(args.interval_ms), socket.recv_from(&mut buf)).await {
            Ok(Ok((len, _))) => {
                let payload = String::from_utf8_lossy(&buf[..len]);
                for (id, px, py) in decode_positions(&payload) {
                    println!("  Player {}: ({:.1}, {:.1})", id, px, py);
                }
            }
            Ok(Err(e)) => println!("Error receiving snapshot: {}", e),
            Err(_) => println!("  No snapshot this step"),
        }

        sleep(Duration::from_millis(args.interval_ms)).await;
    }

    probe::send_disconnect(&socket, udp_addr, client_id).await?;
    registration.disconnect().await?;
    println!("Test client finished");

    Ok(())
}
