use anyhow::Result;
use std::path::PathBuf;

use crate::receipts::read_product_receipts;
use crate::transactions::{list_lineage_locks, list_transactions, TransactionMetadata};
use crate::uninstall::lineage_receipts;
use crate::{ComponentHealth, KeyPathStatus, ProductHealth, SystemLayout};

/// KeyPath presence for each installed component of the lineage. A component
/// is installed exactly when its KeyPath exists.
pub fn verify_product(layout: &SystemLayout, upgrade_code: &str) -> Result<Vec<ProductHealth>> {
    let mut products = Vec::new();
    for receipt in lineage_receipts(layout, upgrade_code)? {
        let mut components = Vec::new();
        for component in &receipt.components {
            let status = if layout.from_relative(&component.key_path)?.exists() {
                KeyPathStatus::Present
            } else {
                KeyPathStatus::Missing
            };
            components.push(ComponentHealth {
                component: component.id.clone(),
                key_path: component.key_path.clone(),
                status,
            });
        }
        products.push(ProductHealth {
            name: receipt.name,
            version: receipt.version,
            scope: receipt.scope,
            components,
        });
    }
    Ok(products)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DoctorReport {
    pub root: PathBuf,
    pub installed_products: usize,
    /// Held lineage locks as `(upgrade_code, txid)`.
    pub held_locks: Vec<(String, Option<String>)>,
    pub unfinished_transactions: Vec<TransactionMetadata>,
}

impl DoctorReport {
    pub fn is_clean(&self) -> bool {
        self.held_locks.is_empty() && self.unfinished_transactions.is_empty()
    }
}

pub fn doctor_report(layout: &SystemLayout) -> Result<DoctorReport> {
    Ok(DoctorReport {
        root: layout.root().to_path_buf(),
        installed_products: read_product_receipts(layout)?.len(),
        held_locks: list_lineage_locks(layout)?,
        unfinished_transactions: list_transactions(layout)?
            .into_iter()
            .filter(|metadata| metadata.status.needs_attention())
            .collect(),
    })
}
