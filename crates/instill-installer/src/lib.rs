mod bundle;
mod emitter;
mod error;
mod fs_utils;
mod layout;
mod plan;
mod receipts;
mod registry;
mod session;
mod shortcuts;
mod transactions;
mod types;
mod uninstall;
mod verify;

pub use bundle::{
    build_package, collect_payload_digests, validate_package, BuiltPackage, LoadedPackage,
    PackageBuildError,
};
pub use emitter::{ActionControl, ActionHooks, CancelToken, NoopHooks};
pub use error::{InstallError, RollbackStatus};
pub use layout::{default_system_root, SystemLayout};
pub use plan::{ActionKind, ActionOp, InstallPlan, PlannedAction};
pub use receipts::{read_product_receipts, serialize_receipt, write_product_receipt};
pub use registry::{read_registry_value, registry_value_path};
pub use session::{install_package, install_package_with_hooks, plan_install, InstallRequest};
pub use shortcuts::{read_shortcut, shortcut_path, ShortcutRecord};
pub use transactions::{
    acquire_lineage_lock, list_lineage_locks, list_transactions, new_txid,
    read_lineage_lock, read_transaction_journal, read_transaction_metadata, LineageLock,
    LockHeld, TransactionJournalEntry, TransactionMetadata, TransactionStatus,
};
pub use types::{
    ComponentHealth, ComponentRecord, InstallOutcome, InstallReport, KeyPathStatus,
    ProductHealth, ProductReceipt, ResourceKind, ResourceRecord, SkippedComponent,
    UninstallOutcome,
};
pub use uninstall::{uninstall_product, uninstall_product_with_hooks};
pub use verify::{doctor_report, verify_product, DoctorReport};

#[cfg(test)]
mod tests;
