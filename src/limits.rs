/// Active (tentative or confirmed) appointments per inspector.
pub const MAX_APPOINTMENTS_PER_INSPECTOR: usize = 50_000;
/// Stored appointments per inspector, cancelled history included.
pub const MAX_HISTORY_PER_INSPECTOR: usize = 100_000;
pub const MAX_INSPECTORS_PER_TENANT: usize = 10_000;
/// Max bytes in any of property / client / notes.
pub const MAX_DETAIL_LEN: usize = 4096;
/// Widest date range a workload query may cover.
pub const MAX_WORKLOAD_RANGE_DAYS: i64 = 366;
pub const MAX_TENANTS: usize = 1_000;
pub const MAX_TENANT_NAME_LEN: usize = 128;
/// Attempts made against a backup sink before reporting the failure.
pub const BACKUP_ATTEMPTS: u32 = 3;
pub const BACKUP_RETRY_DELAY_MS: u64 = 50;
