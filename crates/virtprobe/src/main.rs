use {
    clap::Parser,
    log::debug,
    rsvirt::{
        xdr::{self, XdrEncode},
        Client, Result, PROGRAM_REMOTE,
    },
};

// Remote protocol procedures the probe drives by hand. A full client
// would get these from generated bindings; the probe only needs the
// handful involved in opening a read-only connection and asking the
// daemon about itself.
const PROC_CONNECT_OPEN: u32 = 1;
const PROC_CONNECT_CLOSE: u32 = 2;
const PROC_CONNECT_GET_HOSTNAME: u32 = 59;
const PROC_AUTH_LIST: u32 = 66;
const PROC_CONNECT_GET_LIB_VERSION: u32 = 157;

#[derive(Debug, clap::Parser)]
struct Cli {
    /// proto!address!port
    /// where: proto = tcp | unix
    #[arg(default_value = "unix!/var/run/libvirt/libvirt-sock!0")]
    address: String,
}

/// Arguments for CONNECT_OPEN: no connection name, no flags.
fn connect_open_args() -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    None::<String>.write_xdr(&mut buf)?;
    0u32.write_xdr(&mut buf)?;
    Ok(buf)
}

/// Split libvirt's packed version number into (major, minor, micro).
fn split_version(version: u64) -> (u64, u64, u64) {
    (version / 1_000_000, version / 1_000 % 1_000, version % 1_000)
}

async fn probe_main(Cli { address }: Cli) -> Result<i32> {
    let client = Client::connect(&address).await?;
    debug!("connected to {}", address);

    // The daemon answers nothing of substance before the auth
    // negotiation and connection open have happened, even on a socket
    // with no authentication configured.
    client.request(PROGRAM_REMOTE, PROC_AUTH_LIST, &[]).await?;
    client
        .request(PROGRAM_REMOTE, PROC_CONNECT_OPEN, &connect_open_args()?)
        .await?;

    let payload = client
        .request(PROGRAM_REMOTE, PROC_CONNECT_GET_LIB_VERSION, &[])
        .await?;
    let version: u64 = xdr::from_bytes(&payload)?;

    let payload = client
        .request(PROGRAM_REMOTE, PROC_CONNECT_GET_HOSTNAME, &[])
        .await?;
    let hostname: String = xdr::from_bytes(&payload)?;

    let (major, minor, micro) = split_version(version);
    println!("{}: libvirt {}.{}.{}", hostname, major, minor, micro);

    client.request(PROGRAM_REMOTE, PROC_CONNECT_CLOSE, &[]).await?;
    client.shutdown().await?;

    Ok(0)
}

#[tokio::main]
async fn main() {
    env_logger::init();

    let exit_code = probe_main(Cli::parse()).await.unwrap_or_else(|e| {
        eprintln!("Error: {:?}", e);
        -1
    });

    std::process::exit(exit_code);
}
