use std::time::Duration;

use anyhow::bail;

/// Tuning knobs of the connection core. All timing here drives the collector
///  and the readiness service; per-connection protocol behavior is configured
///  through socket options on the engine instead.
#[derive(Clone, Debug)]
pub struct CudpConfig {
    /// Base interval of the background collector. The collector also wakes
    ///  early when a close or a refused handshake signals it.
    pub collector_interval: Duration,

    /// Extra time a broken listener is kept alive before being moved to the
    ///  closed table, so a client that is mid-handshake can still be adapted.
    pub listener_grace: Duration,

    /// Time a closed record stays observable (status `Closed`) before the
    ///  collector reclaims it and the id becomes `Nonexist`.
    pub reclaim_quiescence: Duration,

    /// Starting value of the per-record hysteresis counter: a broken record
    ///  with undelivered receive data survives this many collector passes
    ///  before teardown.
    pub broken_hysteresis: u32,

    /// Poll granularity for readiness waits that include OS sockets, and for
    ///  the shutdown drain loop.
    pub poll_granularity: Duration,

    /// UDP send/receive buffer sizes applied to newly created channels.
    pub udp_snd_buf_size: usize,
    pub udp_rcv_buf_size: usize,
}

impl Default for CudpConfig {
    fn default() -> CudpConfig {
        CudpConfig {
            collector_interval: Duration::from_secs(1),
            listener_grace: Duration::from_secs(3),
            reclaim_quiescence: Duration::from_secs(1),
            broken_hysteresis: 30,
            poll_granularity: Duration::from_millis(10),
            udp_snd_buf_size: 64 * 1024,
            udp_rcv_buf_size: 64 * 1024,
        }
    }
}

impl CudpConfig {
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.collector_interval.is_zero() {
            bail!("collector interval must not be zero");
        }
        if self.poll_granularity.is_zero() {
            bail!("poll granularity must not be zero");
        }
        if self.udp_snd_buf_size < 1500 || self.udp_rcv_buf_size < 1500 {
            bail!("UDP buffer sizes below a single MTU are not usable");
        }
        Ok(())
    }
}
