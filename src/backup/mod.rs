// Backup orchestrator and WAL archiving
//
// A backup run is a driver over typed stages. Every stage transition is persisted to the
// catalog before the next stage starts, so a crashed run is recognisable and recoverable
// by the next one.

mod orchestrator;
mod wal_archive;

pub use orchestrator::BackupOrchestrator;
pub use wal_archive::WalArchiveReport;
