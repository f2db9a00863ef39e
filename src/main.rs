mod args;
mod logger;
mod net;

use std::{
    io::{self, ErrorKind::BrokenPipe},
    net::{Shutdown, TcpStream},
    process, thread,
};

use anyhow::{Context, Result};
use log::{debug, error, info};

use args::Args;
use logger::Logger;
use net::{Error, socks5::Handshake};

fn forward_stdin(mut sock: TcpStream) {
    match io::copy(&mut io::stdin().lock(), &mut sock) {
        //EOF on stdin, close the write half so the remote end sees it
        Ok(_) => {
            let _ = sock.shutdown(Shutdown::Write);
        }
        Err(e) if e.kind() == BrokenPipe => (),
        Err(e) => {
            error!("stdin: {e}");
            process::exit(1);
        }
    }
}

fn tunnel(sock: TcpStream) -> Result<()> {
    let writer = sock.try_clone()?;
    thread::Builder::new()
        .name("stdin".to_owned())
        .spawn(move || forward_stdin(writer))
        .context("Failed to spawn stdin thread")?;

    match io::copy(&mut &sock, &mut io::stdout().lock()) {
        Ok(_) => Ok(()),
        Err(e) if e.kind() == BrokenPipe => {
            info!("Output closed, exiting...");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

fn run(args: &Args) -> Result<()> {
    info!("Opening tunnel to {} via {}", args.endpoint, args.proxy);
    let handshake = Handshake::run(&args.endpoint, &args.proxy, args.timeout)?;
    let sock = handshake.wait_timeout(args.timeout)?;

    info!("Tunnel established");
    tunnel(sock)
}

fn main() -> Result<()> {
    let args = Args::parse()?;
    Logger::init(args.debug)?;
    debug!("{args:?}");

    match run(&args) {
        Ok(()) => Ok(()),
        Err(e) => match e.downcast_ref::<Error>() {
            Some(rejected @ Error::Rejected(_)) => {
                error!("{rejected}");
                process::exit(2);
            }
            _ => Err(e),
        },
    }
}
