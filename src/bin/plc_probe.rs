/// PLC probe
///
/// One-shot reads and writes against a real or virtual controller.
///
/// ```text
/// plc_probe <protocol> <address|port> read  <device> <count>
/// plc_probe <protocol> <address|port> write <device> <word>...
/// plc_probe <protocol> <address|port> bits  <device> <count>
/// plc_probe <protocol> <address|port> set   <device> <0|1>...
/// plc_probe <protocol> <address|port> raw   <device> <hex bytes>
/// plc_probe --config client.yaml read D100 10
/// ```

use anyhow::{anyhow, bail, Context, Result};
use tracing::info;
use tracing_subscriber::EnvFilter;

use voltage_plc::{ClientConfig, DeviceClient, ProtocolKind};

const USAGE: &str = "usage: plc_probe <protocol> <address|port> <read|write|bits|set|raw> <device> [args...]\n       plc_probe --config <file> <read|write|bits|set|raw> <device> [args...]";

fn parse_word(text: &str) -> Result<u16> {
    match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u16::from_str_radix(hex, 16).with_context(|| format!("bad hex word '{}'", text)),
        None => text.parse().with_context(|| format!("bad word '{}'", text)),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let args: Vec<String> = std::env::args().skip(1).collect();
    let (config, rest) = match args.first().map(String::as_str) {
        Some("--config") => {
            let path = args.get(1).ok_or_else(|| anyhow!(USAGE))?;
            (ClientConfig::from_file(path)?, &args[2..])
        }
        Some(protocol) if args.len() >= 2 => {
            let protocol: ProtocolKind = protocol.parse()?;
            let config = ClientConfig {
                protocol,
                address: args[1].clone(),
                packet_logging: std::env::var("PLC_PACKETS").is_ok(),
                ..Default::default()
            };
            (config, &args[2..])
        }
        _ => bail!(USAGE),
    };

    let (command, device) = match rest {
        [command, device, ..] => (command.as_str(), device.as_str()),
        _ => bail!(USAGE),
    };
    let operands = &rest[2..];

    info!("{} via {:?} at {}", config.protocol, config.link(), config.address);
    let mut client: Box<dyn DeviceClient> = config.build_client()?;
    client
        .connect()
        .await
        .with_context(|| format!("connecting to {}", config.address))?;

    match command {
        "read" => {
            let count = operands.first().map(|c| c.parse::<usize>()).transpose()?.unwrap_or(1usize);
            let values = client.read_words(device, count).await?;
            for (i, value) in values.iter().enumerate() {
                println!("{}+{}: {} (0x{:04X})", device, i, value, value);
            }
        }
        "bits" => {
            let count = operands.first().map(|c| c.parse::<usize>()).transpose()?.unwrap_or(1usize);
            let bits = client.read_bits(device, count).await?;
            let text: String = bits.iter().map(|&b| if b { '1' } else { '0' }).collect();
            println!("{}: {}", device, text);
        }
        "write" => {
            let values = operands.iter().map(|v| parse_word(v)).collect::<Result<Vec<u16>>>()?;
            if values.is_empty() {
                bail!(USAGE);
            }
            client.write_words(device, &values).await?;
            println!("wrote {} word(s) at {}", values.len(), device);
        }
        "set" => {
            let bits: Vec<bool> = operands.iter().map(|v| v != "0").collect();
            if bits.is_empty() {
                bail!(USAGE);
            }
            client.write_bits(device, &bits).await?;
            println!("wrote {} bit(s) at {}", bits.len(), device);
        }
        "raw" => {
            let text: String = operands.concat();
            let bytes = hex::decode(&text).with_context(|| format!("bad hex payload '{}'", text))?;
            client.write_bytes(device, &bytes).await?;
            let back = client.read_bytes(device, bytes.len() / 2).await?;
            println!("{}: {}", device, hex::encode_upper(back));
        }
        other => bail!("unknown command '{}'\n{}", other, USAGE),
    }

    let stats = client.get_stats();
    info!(
        "sent {} frame(s) / {} bytes, received {} chunk(s) / {} bytes",
        stats.requests_sent, stats.bytes_sent, stats.responses_received, stats.bytes_received
    );
    client.close().await?;
    Ok(())
}
