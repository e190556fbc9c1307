use std::{error::Error, io};

use blockwire::{
    Command,
    cli::render,
    engine::statement::is_insert,
    prompt,
    protocol::{Client, ClientError, Compression},
};
use clap::Parser;

#[derive(Parser)]
#[command(version, about, long_about = None)]
struct Cli {
    /// Server address
    #[arg(default_value = "127.0.0.1:9000")]
    address: String,
    /// Default database for unqualified table names
    #[arg(long, default_value = "")]
    database: String,
    #[arg(long, default_value = "default")]
    user: String,
    #[arg(long, default_value = "")]
    password: String,
    /// Compress blocks on the wire
    #[arg(long)]
    compress: bool,
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let cli = Cli::parse();
    let compression = if cli.compress {
        Compression::Enable
    } else {
        Compression::Disable
    };
    let mut client = Client::connect(&cli.address)?
        .with_database(cli.database)
        .with_credentials(cli.user, cli.password)
        .with_compression(compression);
    let hello = client.hello()?;
    println!(
        "connected to {} {}.{} (revision {})",
        hello.name, hello.version_major, hello.version_minor, hello.revision
    );

    let stdio = io::stdin();
    let stdout = io::stdout();

    loop {
        let cmd = match prompt(stdio.lock(), stdout.lock()) {
            Ok(c) => c,
            Err(e) => {
                eprintln!("{e}");
                continue;
            }
        };

        let res = match cmd {
            Command::Exit => break,
            Command::Ping => client.ping().map(|_| println!("pong")),
            Command::Statement(s) if s.is_empty() => continue,
            Command::Statement(s) if is_insert(&s) => {
                eprintln!("INSERT needs data blocks and cannot be run interactively");
                continue;
            }
            Command::Statement(s) => client.query(&s).map(|r| println!("{}", render(&r))),
        };

        match res {
            Ok(()) => {}
            Err(ClientError::Server(e)) => eprintln!("server error {}: {}", e.name, e.message),
            Err(e) => return Err(e.into()),
        }
    }

    Ok(())
}
