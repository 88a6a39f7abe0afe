use crate::peer::types::IceCandidate;
use once_cell::sync::OnceCell;
use std::io::Write;

static INIT: OnceCell<()> = OnceCell::new();

/// Installs the timestamped log backend. Safe to call more than once.
///
/// Honours `RUST_LOG`; defaults to `info`.
pub fn init() {
    INIT.get_or_init(|| {
        if !crate::config::LOGGING_ENABLED || !crate::config::dev::ENABLE_LOGGING {
            return;
        }

        let env = env_logger::Env::default().default_filter_or("info");
        let _ = env_logger::Builder::from_env(env)
            .format(|buf, record| {
                let now = chrono::Local::now();
                writeln!(
                    buf,
                    "RUST: [{}] {} {}",
                    now.format("%Y-%m-%d %H:%M:%S%.3f"),
                    record.level(),
                    record.args()
                )
            })
            .try_init();
    });
}

/// Trace line for a trickle-ICE candidate.
pub fn dump_candidate(label: &str, cand: &IceCandidate) {
    log::debug!(
        "Trickle {label}: candidate={} sdp_mid={:?} sdp_mline_index={:?} from={}",
        cand.candidate,
        cand.sdp_mid,
        cand.sdp_mline_index,
        cand.from
    );
}
