use std::env;
use std::net::SocketAddr;
use std::process;
use std::sync::Arc;

use log::info;

use lightvoice::{EventLoop, LoopThread, RoomRegistry, VoiceServer};

const DEFAULT_PORT: u16 = 8888;
const WORKER_THREADS: usize = 4;

fn main() -> std::io::Result<()> {
    env_logger::init();

    let port = match env::args().nth(1) {
        Some(arg) => match arg.parse() {
            Ok(port) => port,
            Err(_) => {
                eprintln!("usage: lightvoice [port]");
                process::exit(2);
            }
        },
        None => DEFAULT_PORT,
    };
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    // The main thread runs the accept loop; mixing gets its own reactor so a
    // slow tick can never hold up accepts.
    let base = EventLoop::new()?;
    let mix = LoopThread::spawn("lightvoice-mix")?;
    let registry = Arc::new(RoomRegistry::new(Arc::clone(mix.handle())));

    let server = VoiceServer::new(Arc::clone(base.handle()), addr, WORKER_THREADS, registry)?;
    server.start()?;
    info!("lightvoice listening on {}", server.local_addr());

    base.run();
    Ok(())
}
