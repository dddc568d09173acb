use std::{num::ParseIntError, str, time::Duration};

use bytes::Bytes;
use clap::Parser;
use tracing::info;
use ttl_cache::{Config, Db, Error};

type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Parser, Debug)]
#[command(name = "ttl-cache-demo", version = env!("CARGO_PKG_VERSION"), about = "Store entries and watch them expire")]
/// `Cli` 结构体用于解析命令行参数。
struct Cli {
    /// 条目存活时间，单位毫秒。
    #[arg(short, long, value_parser = duration_from_str, default_value = "1000")]
    ttl: Duration,

    /// 要写入的键值对，格式为 `key=value`。
    #[arg(required = true, value_parser = pair_from_str)]
    pairs: Vec<(String, Bytes)>,
}

fn duration_from_str(s: &str) -> Result<Duration, ParseIntError> {
    let ms = s.parse::<u64>()?;
    Ok(Duration::from_millis(ms))
}

fn pair_from_str(s: &str) -> Result<(String, Bytes), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got {:?}", s))?;
    Ok((key.to_string(), Bytes::from(value.to_string())))
}

fn print_value(key: &str, value: &Bytes) {
    if let Ok(string) = str::from_utf8(value) {
        println!("{} => \"{}\"", key, string);
    } else {
        println!("{} => {:?}", key, value);
    }
}

#[tokio::main]
async fn main() -> Result<(), BoxError> {
    tracing_subscriber::fmt::try_init()?;

    let cli = Cli::parse();

    let db: Db<Bytes> = Db::with_config(Config::default().with_ttl(cli.ttl));

    for (key, value) in &cli.pairs {
        db.set(key.clone(), value.clone())?;
    }

    for (key, _) in &cli.pairs {
        let value = db.get(key)?;
        print_value(key, &value);
    }

    info!(ttl = ?cli.ttl, "waiting for entries to expire");
    tokio::time::sleep(cli.ttl + Duration::from_millis(10)).await;

    for (key, _) in &cli.pairs {
        match db.get(key) {
            Ok(value) => print_value(key, &value),
            Err(Error::NotFound) => println!("{} => (nil)", key),
        }
    }

    Ok(())
}
