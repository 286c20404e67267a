//! Copy stdin to stdout at a limited rate.
//!
//! Usage: `throttle_copy <rate> [<burst>]`, e.g. `throttle_copy 100KiB 1MiB`.
//! Set `RUST_LOG=debug` to see the throttle at work.

use std::io::Write;

use anyhow::{format_err, Error};

use proxmox_bandwidth_throttle::{BandwidthThrottle, HumanByte, ThrottleConfig, ThrottleMode};

fn main() -> Result<(), Error> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = std::env::args().skip(1);
    let rate: HumanByte = args
        .next()
        .ok_or_else(|| format_err!("missing rate parameter"))?
        .parse()?;

    let mut config = ThrottleConfig::new(rate);
    config.burst = args.next().map(|burst| burst.parse()).transpose()?;
    config.mode = ThrottleMode::Write;

    let throttle = BandwidthThrottle::from_config(&config)?;
    log::info!("copying with {}", serde_json::to_string(&config)?);

    let mut stdout = throttle.throttle(std::io::stdout().lock())?;
    let copied = std::io::copy(&mut std::io::stdin().lock(), &mut stdout)?;
    stdout.flush()?;

    log::info!("copied {copied} bytes");
    Ok(())
}
