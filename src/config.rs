use std::{
    env::{self, VarError},
    path::PathBuf,
};

use anyhow::Context;
use rearch::{CData, CapsuleHandle, Container};
use tracing::{info, instrument, warn};
use tracing_subscriber::EnvFilter;
use url::Url;

use crate::snapshot::SnapshotFile;

/// # Errors
/// Will return [`Err`] if the snapshot file cannot be opened or created.
#[instrument]
pub async fn init_container() -> anyhow::Result<Container> {
    info!("Initializing container");
    let container = Container::new();

    let (snapshot_path, set_snapshot_file) =
        container.read((snapshot_path_capsule, snapshot_file_init_action));

    info!(?snapshot_path, "Opening snapshot file");
    set_snapshot_file(
        SnapshotFile::open(snapshot_path)
            .await
            .context("Failed to initialize the snapshot file")?,
    );

    let (public_base_url, trust_forwarded_for) =
        container.read((public_base_url_capsule, trust_forwarded_for_capsule));
    container.read(request_settings_init_action)(RequestSettings {
        public_base_url,
        trust_forwarded_for,
    });

    info!("Container initialized");
    Ok(container)
}

/// # Panics
/// Panics when environment variable is invalid unicode.
pub fn snapshot_path_capsule(_: CapsuleHandle) -> PathBuf {
    const ENV_VAR_NAME: &str = "DB_PATH";
    const DEFAULT_PATH: &str = "urls.json";

    read_env_var(ENV_VAR_NAME).map_or_else(
        || {
            warn!(
                path = DEFAULT_PATH,
                "{ENV_VAR_NAME} environment variable not set; defaulting to {DEFAULT_PATH}"
            );
            PathBuf::from(DEFAULT_PATH)
        },
        PathBuf::from,
    )
}

fn snapshot_file_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (
    Option<SnapshotFile>,
    impl use<> + CData + Fn(Option<SnapshotFile>),
) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn snapshot_file_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(SnapshotFile) {
    let set_snapshot_file = get.as_ref(snapshot_file_manager).1.clone();
    move |file| set_snapshot_file(Some(file))
}

/// # Panics
/// Panics when the [`SnapshotFile`] was not set via [`snapshot_file_init_action`].
pub fn snapshot_file_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> SnapshotFile {
    let file = get.as_ref(snapshot_file_manager).0.clone();
    file.expect("SnapshotFile should've been set via snapshot_file_init_action!")
}

/// Settings that change how owner keys and base addresses are derived from
/// each request.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct RequestSettings {
    pub public_base_url: Option<Url>,
    pub trust_forwarded_for: bool,
}

fn request_settings_manager(
    CapsuleHandle { register, .. }: CapsuleHandle,
) -> (
    Option<RequestSettings>,
    impl use<> + CData + Fn(Option<RequestSettings>),
) {
    register.register(rearch_effects::state::<rearch_effects::Cloned<_>>(None))
}

pub fn request_settings_init_action(
    CapsuleHandle { mut get, .. }: CapsuleHandle,
) -> impl use<> + CData + Fn(RequestSettings) {
    let set_request_settings = get.as_ref(request_settings_manager).1.clone();
    move |settings| set_request_settings(Some(settings))
}

/// # Panics
/// Panics when the [`RequestSettings`] were not set via
/// [`request_settings_init_action`].
pub fn request_settings_capsule(CapsuleHandle { mut get, .. }: CapsuleHandle) -> RequestSettings {
    let settings = get.as_ref(request_settings_manager).0.clone();
    settings.expect("RequestSettings should've been set via request_settings_init_action!")
}

/// # Panics
/// Panics when environment variable is invalid.
pub fn addr_capsule(_: CapsuleHandle) -> String {
    const ENV_VAR_NAME: &str = "ADDR";
    const DEFAULT_ADDR: &str = "127.0.0.1:5020";

    if let Some(addr) = read_env_var(ENV_VAR_NAME) {
        info!(addr, "{ENV_VAR_NAME} environment variable set");
        addr
    } else {
        warn!(
            addr = DEFAULT_ADDR,
            "{ENV_VAR_NAME} environment variable not set; defaulting to {DEFAULT_ADDR}"
        );
        DEFAULT_ADDR.to_string()
    }
}

/// Base address to put in front of short ids, overriding the one derived from
/// each request's `Host` header.
///
/// # Panics
/// Panics when environment variable is not a valid URL.
pub fn public_base_url_capsule(_: CapsuleHandle) -> Option<Url> {
    const ENV_VAR_NAME: &str = "PUBLIC_BASE_URL";

    let raw = read_env_var(ENV_VAR_NAME)?;
    match Url::parse(&raw) {
        Ok(url) => {
            info!(%url, "{ENV_VAR_NAME} environment variable set");
            Some(url)
        }
        Err(err) => panic!("{ENV_VAR_NAME} environment variable is not a valid URL: {err}"),
    }
}

/// Whether owner keys come from the first `X-Forwarded-For` entry instead of
/// the TCP peer address. Only enable behind a proxy that sets the header.
///
/// # Panics
/// Panics when environment variable is not a recognized boolean.
pub fn trust_forwarded_for_capsule(_: CapsuleHandle) -> bool {
    const ENV_VAR_NAME: &str = "TRUST_FORWARDED_FOR";

    let Some(raw) = read_env_var(ENV_VAR_NAME) else {
        return false;
    };
    parse_flag(&raw).unwrap_or_else(|| {
        panic!("{ENV_VAR_NAME} environment variable must be true/false/1/0, got {raw:?}")
    })
}

/// Log filter taken from `RUST_LOG`, or `info` when it is unset or invalid.
#[must_use]
pub fn log_filter() -> EnvFilter {
    log_filter_from(env::var(EnvFilter::DEFAULT_ENV).ok().as_deref())
}

fn log_filter_from(directives: Option<&str>) -> EnvFilter {
    const DEFAULT_DIRECTIVES: &str = "info";

    directives
        .and_then(|directives| EnvFilter::try_new(directives).ok())
        .unwrap_or_else(|| EnvFilter::new(DEFAULT_DIRECTIVES))
}

fn read_env_var(name: &str) -> Option<String> {
    match env::var(name) {
        Ok(value) => Some(value),
        Err(VarError::NotPresent) => None,
        Err(VarError::NotUnicode(actual)) => {
            panic!("{name} environment variable is invalid: {}", actual.display());
        }
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" | "" => Some(false),
        _ => None,
    }
}
