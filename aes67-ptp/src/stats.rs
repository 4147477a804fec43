//! Observable slave status.

/// Snapshot of the slave's synchronisation state, safe to read from any
/// thread. The master identity may lag a beat behind the atomics; readers
/// tolerate that.
#[derive(Debug, Clone, Default)]
pub struct PtpStatus {
    /// Grandmaster clock identity, `XX-XX-..` hex. Empty until learned.
    pub master_id: String,
    /// True once a full Sync (or Sync + Follow_Up) has been processed.
    pub synchronized: bool,
    /// Master clock offset in audio samples, signed.
    pub offset_samples: i64,
    /// Seconds field of the last master timestamp (48-bit on the wire).
    pub master_seconds: u64,
    /// Nanoseconds field of the last master timestamp.
    pub master_nanoseconds: u32,
    /// Local monotonic receipt time of that timestamp, in samples.
    pub local_timestamp_samples: i64,
    /// Sync messages accepted.
    pub sync_count: u64,
    /// Follow_Up messages matched to a pending Sync.
    pub follow_up_count: u64,
    /// Delay_Resp messages matched to an outstanding Delay_Req.
    pub delay_resp_count: u64,
}
