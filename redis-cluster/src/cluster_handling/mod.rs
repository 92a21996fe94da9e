use crate::Cmd;

pub mod async_connection;
pub mod client;
pub(crate) mod pool;
/// Routing information for cluster commands.
pub mod routing;
pub mod slot_map;
pub(crate) mod topology;

pub(crate) fn slot_cmd() -> Cmd {
    let mut cmd = Cmd::new();
    cmd.arg("CLUSTER").arg("SLOTS");
    cmd
}

pub(crate) fn config_get_full_coverage_cmd() -> Cmd {
    let mut cmd = Cmd::new();
    cmd.arg("CONFIG")
        .arg("GET")
        .arg("cluster-require-full-coverage");
    cmd
}

pub(crate) fn asking_cmd() -> Cmd {
    let mut cmd = Cmd::new();
    cmd.arg("ASKING");
    cmd
}
