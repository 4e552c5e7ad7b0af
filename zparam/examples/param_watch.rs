use std::sync::Arc;
use std::time::Duration;

use zparam::{
    BoolParameter, FloatParameter, IntParameter, ParameterRegistry, Result, config::BrokerConfig,
    session,
};

enum Watched {
    Int(Arc<IntParameter>),
    Float(Arc<FloatParameter>),
    Bool(Arc<BoolParameter>),
}

impl Watched {
    fn line(&self) -> String {
        match self {
            Watched::Int(p) => format!("{:12} = {}", p.entity_id(), p.value()),
            Watched::Float(p) => format!("{:12} = {:.3}", p.entity_id(), p.value()),
            Watched::Bool(p) => format!("{:12} = {}", p.entity_id(), p.value()),
        }
    }
}

/// `name:kind`, kind one of int, float, bool; kind defaults to float
fn parse_param(arg: &str) -> (String, String) {
    match arg.split_once(':') {
        Some((name, kind)) => (name.to_string(), kind.to_lowercase()),
        None => (arg.to_string(), "float".to_string()),
    }
}

async fn run_publisher(registry: &ParameterRegistry, key: &str, value: f64) -> Result<()> {
    let payload = registry.publish(key, value)?;
    println!("Published:>> {}{} = {}", registry.control_root(), key, payload);
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    zenoh::init_log_from_env_or("info");
    let args = Args::parse();

    let mut broker = match args.config {
        Some(ref path) => BrokerConfig::from_file(path)?,
        None => BrokerConfig::from_env_or_default()?,
    };
    if let Some(host) = args.host {
        broker.host = host;
    }
    if let Some(port) = args.port {
        broker.port = port;
    }
    if let Some(root) = args.root {
        broker.root_topic = root;
    }
    if let Some(control) = args.control {
        broker.control_root = control;
    }
    if let Some(timeout) = args.timeout {
        broker.connect_timeout_secs = timeout;
    }
    let period = Duration::try_from_secs_f64(args.period)
        .map_err(|e| format!("Invalid --period {}: {}", args.period, e))?;

    let connection = Arc::new(session::connect(&broker)?);
    let registry = ParameterRegistry::from_config(connection, &broker);

    let mut watched = Vec::new();
    for arg in &args.param {
        let (name, kind) = parse_param(arg);
        let param = match kind.as_str() {
            "int" => Watched::Int(registry.declare_int(&name, 0)?),
            "bool" => Watched::Bool(registry.declare_bool(&name, false)?),
            "float" => Watched::Float(registry.declare_float(&name, 0.0)?),
            other => {
                println!("Unknown kind \"{}\" for {}, use int, float or bool", other, name);
                continue;
            }
        };
        watched.push(param);
    }

    if let Some(ref key) = args.publish {
        run_publisher(&registry, key, args.value).await?;
    }

    for _ in 0..args.count {
        tokio::time::sleep(period).await;
        let status = registry.connection().status();
        println!("-- {} --", status.state);
        for p in &watched {
            println!("{}", p.line());
        }
    }

    registry.shutdown()
}

use clap::Parser;
#[derive(Debug, Parser)]
struct Args {
    /// Parameters to watch as name:kind
    #[arg(short = 'P', long = "param")]
    param: Vec<String>,
    #[arg(long)]
    host: Option<String>,
    #[arg(long)]
    port: Option<u16>,
    #[arg(short, long)]
    root: Option<String>,
    #[arg(long)]
    control: Option<String>,
    /// json5 broker config file
    #[arg(short, long)]
    config: Option<String>,
    /// Connect timeout in seconds
    #[arg(short, long)]
    timeout: Option<u64>,
    /// Control key to publish once after connecting
    #[arg(long)]
    publish: Option<String>,
    #[arg(short, long, default_value = "0.0")]
    value: f64,
    #[arg(short, long, default_value = "1.0")]
    period: f64,
    #[arg(short = 'n', long, default_value = "10")]
    count: u32,
}
