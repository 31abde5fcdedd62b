use anyhow::{bail, Context, Result};
use clap::Parser;
use colored::*;
use indicatif::{ProgressBar, ProgressStyle};
use std::fs;
use std::net::{ToSocketAddrs, UdpSocket};
use std::path::PathBuf;
use std::time::Duration;

use update_core::codec::{encode_image_data, encode_metadata, HEADER_LEN};
use update_core::config::DEFAULT_LISTEN_PORT;
use update_core::{Metadata, Reply};

/// Keeps datagrams under a typical 1500 byte MTU
const MAX_CHUNK_SIZE: usize = 1400;

#[derive(Parser)]
#[command(name = "ota-tool")]
#[command(about = "UDP OTA flashing tool for the update receiver", long_about = None)]
struct Cli {
    /// Device IP address or hostname
    #[arg(value_name = "HOST")]
    host: String,

    /// Firmware image to send
    #[arg(short, long, default_value = "target/xtensa-esp32s3-espidf/release/udp-ota-receiver.bin")]
    firmware: PathBuf,

    /// Receiver UDP port
    #[arg(short, long, default_value_t = DEFAULT_LISTEN_PORT)]
    port: u16,

    /// Image bytes per datagram
    #[arg(long, default_value_t = 1024)]
    chunk_size: usize,

    /// Time to wait for each reply
    #[arg(long, default_value_t = 1000)]
    timeout_ms: u64,

    /// Attempts per packet before giving up
    #[arg(long, default_value_t = 5)]
    retries: u32,
}

struct Link {
    socket: UdpSocket,
    retries: u32,
}

impl Link {
    fn open(host: &str, port: u16, timeout: Duration, retries: u32) -> Result<Self> {
        let address = (host, port)
            .to_socket_addrs()
            .with_context(|| format!("Cannot resolve {}", host))?
            .next()
            .with_context(|| format!("No address for {}", host))?;

        let socket = UdpSocket::bind(("0.0.0.0", 0))?;
        socket.set_read_timeout(Some(timeout))?;
        socket.connect(address)?;
        Ok(Self { socket, retries })
    }

    /// Send a datagram until a reply arrives, resending on silence
    fn exchange(&self, datagram: &[u8]) -> Result<Reply> {
        let mut buf = [0u8; 64];
        for attempt in 1..=self.retries {
            self.socket.send(datagram)?;
            match self.socket.recv(&mut buf) {
                Ok(len) => match Reply::decode(&buf[..len]) {
                    Some(reply) => return Ok(reply),
                    None => eprintln!("   {} unexpected {} byte reply", "⚠".yellow(), len),
                },
                Err(e) if matches!(e.kind(), std::io::ErrorKind::WouldBlock | std::io::ErrorKind::TimedOut) => {
                    if attempt < self.retries {
                        eprintln!("   {} no reply, retrying ({}/{})", "⚠".yellow(), attempt, self.retries);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
        bail!("Device did not answer after {} attempts", self.retries)
    }
}

/// Wrapping byte sum, logged by the receiver
fn image_checksum(image: &[u8]) -> u32 {
    image.iter().fold(0u32, |sum, byte| sum.wrapping_add(u32::from(*byte)))
}

fn main() {
    let cli = Cli::parse();

    match upload_firmware(&cli) {
        Ok(()) => println!("\n✨ {}", "OTA update completed successfully!".green()),
        Err(e) => {
            println!("\n{} {:#}", "❌ OTA update failed:".red(), e);
            std::process::exit(1);
        }
    }
}

fn upload_firmware(cli: &Cli) -> Result<()> {
    if cli.chunk_size == 0 || cli.chunk_size > MAX_CHUNK_SIZE {
        bail!("Chunk size must be between 1 and {} bytes", MAX_CHUNK_SIZE);
    }

    let firmware = fs::read(&cli.firmware)
        .with_context(|| format!("Failed to read firmware {}", cli.firmware.display()))?;
    if firmware.is_empty() {
        bail!("Firmware file is empty");
    }

    let chunks: Vec<&[u8]> = firmware.chunks(cli.chunk_size).collect();
    let metadata = Metadata {
        image_size_bytes: u32::try_from(firmware.len()).context("Firmware larger than 4GB")?,
        num_packets: chunks.len() as u32,
        image_checksum: image_checksum(&firmware),
    };

    println!("\n📤 {} {}:{}", "Updating".cyan(), cli.host, cli.port);
    println!(
        "   Firmware: {} bytes ({:.2} MB) in {} packets of up to {} bytes",
        firmware.len(),
        firmware.len() as f64 / 1024.0 / 1024.0,
        chunks.len(),
        cli.chunk_size + HEADER_LEN + 4
    );

    let link = Link::open(&cli.host, cli.port, Duration::from_millis(cli.timeout_ms), cli.retries)?;

    match link.exchange(&encode_metadata(0, &metadata))? {
        Reply::Ack(_) => {}
        Reply::Error => bail!("Device refused the update (could not open target partition)"),
    }

    let pb = ProgressBar::new(firmware.len() as u64);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("   {spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );

    for (index, chunk) in chunks.iter().enumerate() {
        let sequence_number = index as u32 + 1;
        let datagram = encode_image_data(sequence_number, chunk);

        let mut attempts = 0;
        loop {
            attempts += 1;
            match link.exchange(&datagram)? {
                Reply::Ack(acked) if acked >= sequence_number => break,
                Reply::Ack(acked) => {
                    pb.println(format!("   {} device acked {} for packet {}", "⚠".yellow(), acked, sequence_number));
                }
                Reply::Error => {
                    pb.println(format!("   {} device rejected packet {}", "⚠".yellow(), sequence_number));
                }
            }
            if attempts >= cli.retries {
                pb.abandon();
                bail!("Packet {} not accepted after {} attempts", sequence_number, attempts);
            }
        }
        pb.inc(chunk.len() as u64);
    }

    pb.finish_and_clear();
    println!("   {} Upload successful! Device will switch partitions and restart.", "✅".green());
    Ok(())
}
