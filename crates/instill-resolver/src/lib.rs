mod resolve;
mod types;

pub use resolve::{find_related_products, resolve_install_mode};
pub use types::{DeclineReason, InstallMode, InstalledProduct, ResolvedAction, UpgradeDecision};

#[cfg(test)]
mod tests;
