use clap::Parser;
use std::error::Error;
use vpw_link::{
    PortConfiguration,
    device::{SerialDevice, TimeoutScenario, VpwSpeed, serial::SerialAdapter},
    serial::{self, SerialTransport},
};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Serial port path of the interface box
    #[arg(short, long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Baud rate of the serial link to the interface box
    #[arg(short, long, default_value_t = 115_200)]
    baud: u32,

    /// Bus speed (`standard` or `fourx`)
    #[arg(short, long, default_value = "standard")]
    speed: VpwSpeed,

    /// Stop after this many messages (runs forever if omitted)
    #[arg(short, long)]
    count: Option<usize>,

    /// List available serial ports and exit
    #[arg(short, long)]
    list: bool,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args = Args::parse();

    if args.list {
        for info in serial::available_ports()? {
            match (info.usb_id, info.product) {
                (Some((vid, pid)), product) => println!(
                    "{} [{vid:04x}:{pid:04x}] {}",
                    info.path,
                    product.unwrap_or_default()
                ),
                (None, _) => println!("{}", info.path),
            }
        }

        return Ok(());
    }

    let transport = SerialTransport::new(&args.port);
    let mut dev = SerialDevice::new(SerialAdapter::new(
        transport,
        PortConfiguration::new(args.baud),
    ));

    if !dev.initialize().await {
        return Err(format!("No interface box found on {}", args.port).into());
    }

    if !dev.set_vpw_speed(args.speed).await {
        return Err(format!("Failed to switch bus to {} speed", args.speed).into());
    }

    if !dev.set_timeout(TimeoutScenario::ReadProperty).await {
        return Err("Failed to set read timeout".into());
    }

    let mut received = 0;

    while args.count.is_none_or(|count| received < count) {
        if let Some(msg) = dev.receive_message().await {
            println!("{msg}");
            received += 1;
        }
    }

    dev.close();

    Ok(())
}
