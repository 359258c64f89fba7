//! A standalone mailbox PV server: reads a TOML description of the PVs to
//! publish, opens each as a mailbox (puts store, monitors follow) and
//! serves them until interrupted.

use clap::{App, Arg};
use ion::config::Config;
use ion::logging;
use positron::data::bitset::BitSet;
use positron::data::value::{Field, PVField, PVStructure, ScalarKind, Structure};
use positron::pv::{Provider, PvConfig, SharedPV, StaticProvider};
use positron::server::ServerContext;
use serde_derive::Deserialize;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

#[derive(Deserialize)]
struct ServiceConfig {
    #[serde(default)]
    settings: Config,
    #[serde(default, rename = "pv")]
    pvs: Vec<PvSpec>,
}

#[derive(Deserialize)]
struct PvSpec {
    name: String,
    #[serde(default = "default_kind")]
    kind: String,
    value: Option<String>,
}

fn default_kind() -> String {
    "double".to_owned()
}

impl Default for ServiceConfig {
    fn default() -> ServiceConfig {
        ServiceConfig {
            settings: Config::default(),
            pvs: vec![PvSpec {
                name: "demo".to_owned(),
                kind: default_kind(),
                value: Some("0".to_owned()),
            }],
        }
    }
}

fn scalar_kind(name: &str) -> Option<ScalarKind> {
    match name {
        "bool" => Some(ScalarKind::Boolean),
        "int" => Some(ScalarKind::Int),
        "long" => Some(ScalarKind::Long),
        "float" => Some(ScalarKind::Float),
        "double" => Some(ScalarKind::Double),
        "string" => Some(ScalarKind::Str),
        _ => None,
    }
}

fn initial_field(kind: ScalarKind, text: &str) -> Result<PVField, String> {
    macro_rules! parsed {
        ($variant:ident) => {
            PVField::$variant(
                text.parse()
                    .map_err(|err| format!("bad initial value '{}': {}", text, err))?,
            )
        };
    }
    Ok(match kind {
        ScalarKind::Boolean => parsed!(Boolean),
        ScalarKind::Int => parsed!(Int),
        ScalarKind::Long => parsed!(Long),
        ScalarKind::Float => parsed!(Float),
        ScalarKind::Double => parsed!(Double),
        ScalarKind::Str => PVField::Str(text.to_owned()),
        _ => return Err(format!("kind {:?} takes no initial value", kind)),
    })
}

fn build_pv(spec: &PvSpec) -> Result<Arc<SharedPV>, String> {
    let pv = SharedPV::build_mailbox(PvConfig::default());

    let field = match spec.kind.as_str() {
        "byte_array" => Field::ScalarArray(ScalarKind::UByte),
        kind => Field::Scalar(scalar_kind(kind).ok_or_else(|| format!("unknown kind '{}'", kind))?),
    };
    let structure = Structure::new("softserve:mailbox", vec![("value".to_owned(), field.clone())]);
    let mut value = PVStructure::new_default(structure);

    let valid = match (&field, &spec.value) {
        (Field::Scalar(kind), Some(text)) => {
            value.set("value", initial_field(*kind, text)?)?;
            BitSet::of(0)
        }
        _ => BitSet::new(),
    };

    pv.open(&value, &valid).map_err(|err| format!("{:?}", err))?;
    Ok(pv)
}

pub fn main() {
    let matches = App::new("softserve")
        .version("0.1.0")
        .about("Serves mailbox PVs over the positron protocol.")
        .arg(
            Arg::with_name("CONFIG_FILE")
                .help("Path to the TOML config file; omit to serve a single 'demo' PV")
                .required(false),
        )
        .arg(
            Arg::with_name("port")
                .long("port")
                .takes_value(true)
                .help("Overrides the configured server port"),
        )
        .get_matches();

    let log = logging::init();

    let mut service_config = match matches.value_of("CONFIG_FILE") {
        Some(path) => match serdeconv::from_toml_file::<ServiceConfig, _>(path) {
            Ok(config) => config,
            Err(err) => {
                logging::error!(log, "failed to load config"; "path" => path, "error" => %err);
                std::process::exit(1);
            }
        },
        None => ServiceConfig::default(),
    };
    service_config.settings.apply_env();

    if let Some(port) = matches.value_of("port") {
        match port.parse() {
            Ok(port) => service_config.settings.server_port = port,
            Err(_) => {
                logging::error!(log, "bad port override"; "port" => port);
                std::process::exit(1);
            }
        }
    }

    let provider = StaticProvider::new("softserve");
    for spec in &service_config.pvs {
        match build_pv(spec) {
            Ok(pv) => {
                logging::info!(log, "serving pv"; "name" => %spec.name, "kind" => %spec.kind);
                provider.add(spec.name.clone(), pv);
            }
            Err(err) => {
                logging::error!(log, "skipping pv"; "name" => %spec.name, "error" => err);
            }
        }
    }

    let providers: Vec<Arc<dyn Provider>> = vec![provider];
    let server = match ServerContext::start(service_config.settings, providers, &log) {
        Ok(server) => server,
        Err(err) => {
            logging::error!(log, "failed to start server"; "error" => ?err);
            std::process::exit(1);
        }
    };
    logging::info!(log, "ready"; "address" => %server.local_addr());

    loop {
        thread::sleep(Duration::from_secs(3600));
    }
}
