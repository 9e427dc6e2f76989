//! Headless client for poking a running server by hand.
//!
//! `test_client game` joins the game channel and wiggles its paddle.
//! `test_client chat --name ana` joins the chat relay and sends stdin lines.

use clap::{Parser, Subcommand};
use shared::{
    decode, decode_line, encode, encode_line, ChatLog, Message, DEFAULT_CHAT_PORT,
    DEFAULT_GAME_PORT, MAX_DATAGRAM_SIZE,
};
use std::net::SocketAddr;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpStream, UdpSocket};
use tokio::time::{sleep, timeout};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Server host
    #[arg(short = 'H', long, default_value = "127.0.0.1")]
    host: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Send HELLO and a stream of INPUT messages, printing the state
    Game {
        #[arg(short, long, default_value_t = DEFAULT_GAME_PORT)]
        port: u16,
        /// Number of inputs to send
        #[arg(short, long, default_value = "20")]
        count: u32,
        /// Delay between inputs in milliseconds
        #[arg(short, long, default_value = "250")]
        interval: u64,
    },
    /// Join the chat and relay stdin lines as CHAT messages
    Chat {
        #[arg(short, long, default_value_t = DEFAULT_CHAT_PORT)]
        port: u16,
        #[arg(short, long, default_value = "tester")]
        name: String,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    match args.command {
        Command::Game {
            port,
            count,
            interval,
        } => {
            let server: SocketAddr = format!("{}:{}", args.host, port).parse()?;
            run_game(server, count, Duration::from_millis(interval)).await
        }
        Command::Chat { port, name } => run_chat(&format!("{}:{}", args.host, port), &name).await,
    }
}

async fn run_game(
    server: SocketAddr,
    count: u32,
    interval: Duration,
) -> Result<(), Box<dyn std::error::Error>> {
    let socket = UdpSocket::bind("0.0.0.0:0").await?;
    println!("Client socket bound to {}", socket.local_addr()?);

    println!("Sending HELLO to {}", server);
    socket.send_to(&encode(&Message::Hello), server).await?;

    let mut buf = [0u8; MAX_DATAGRAM_SIZE];
    let id = loop {
        let (len, _) = match timeout(Duration::from_secs(2), socket.recv_from(&mut buf)).await {
            Ok(received) => received?,
            Err(_) => {
                println!("No ASSIGN received, room is probably full");
                return Ok(());
            }
        };
        if let Ok(Message::Assign(id)) = decode(&buf[..len]) {
            break id;
        }
    };
    println!("Assigned player id {}", id);

    for i in 0..count {
        let value = (i as f32 / 3.0).sin();
        socket
            .send_to(&encode(&Message::Input(value)), server)
            .await?;
        println!("Sent INPUT:{:.2}", value);

        // Print whatever arrived since the last input.
        let deadline = tokio::time::Instant::now() + interval;
        while let Ok(received) =
            tokio::time::timeout_at(deadline, socket.recv_from(&mut buf)).await
        {
            let (len, _) = received?;
            match decode(&buf[..len]) {
                Ok(Message::PlayerState { id, x, y }) => println!("  player {}: ({:.2}, {:.2})", id, x, y),
                Ok(Message::BallState { x, y }) => println!("  ball: ({:.2}, {:.2})", x, y),
                Ok(Message::Score { left, right }) => println!("  score {}:{}", left, right),
                Ok(other) => println!("  {:?}", other),
                Err(e) => println!("  undecodable datagram: {}", e),
            }
        }
    }

    println!("Test client finished");
    Ok(())
}

async fn run_chat(server: &str, name: &str) -> Result<(), Box<dyn std::error::Error>> {
    let stream = TcpStream::connect(server).await?;
    println!("Connected to chat at {}", server);
    let (read_half, mut write_half) = stream.into_split();

    write_half
        .write_all(encode_line(&Message::Connect(name.to_string())).as_bytes())
        .await?;

    let printer = tokio::spawn(async move {
        let mut log = ChatLog::default();
        let mut lines = BufReader::new(read_half).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            match decode_line(&line) {
                Ok(message) => {
                    if log.apply(&message) {
                        if let Some(latest) = log.lines().last() {
                            println!("{}", latest);
                        }
                    }
                }
                Err(e) => println!("(undecodable line: {})", e),
            }
        }
        println!("Server closed the connection");
    });

    let mut stdin = BufReader::new(tokio::io::stdin()).lines();
    while let Some(body) = stdin.next_line().await? {
        if body.is_empty() {
            continue;
        }
        let chat = Message::Chat {
            sender: name.to_string(),
            body,
        };
        write_half.write_all(encode_line(&chat).as_bytes()).await?;
        println!("{}", chat_line(&chat));
    }

    write_half
        .write_all(encode_line(&Message::Disconnect(name.to_string())).as_bytes())
        .await?;
    write_half.shutdown().await?;
    sleep(Duration::from_millis(100)).await;
    printer.abort();

    Ok(())
}

/// Local echo of our own message, formatted like the log.
fn chat_line(message: &Message) -> String {
    let mut log = ChatLog::new(1);
    log.apply(message);
    log.render()
}
