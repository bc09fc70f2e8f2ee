use instill_core::{InstallScope, PackageIdentity, ProductVersion, ResolvedScope, SameVersionPolicy};

use super::*;

const LINEAGE: &str = "6F1C2A3B-1111-4222-8333-944455556666";
const OTHER_LINEAGE: &str = "0A0A0A0A-2222-4333-8444-555566667777";

fn version(value: &str) -> ProductVersion {
    ProductVersion::parse(value).expect("valid version")
}

fn package(target: &str) -> PackageIdentity {
    PackageIdentity {
        name: "Tally".to_string(),
        manufacturer: "Acme".to_string(),
        upgrade_code: LINEAGE.to_string(),
        version: version(target),
        scope: InstallScope::Either,
        same_version: SameVersionPolicy::Decline,
        downgrade_message: "A newer version of Tally is already installed.".to_string(),
    }
}

fn installed(code: &str, value: &str, scope: ResolvedScope) -> InstalledProduct {
    InstalledProduct {
        name: "Tally".to_string(),
        upgrade_code: code.to_string(),
        version: version(value),
        scope,
    }
}

#[test]
fn no_related_product_is_a_fresh_install() {
    let others = vec![installed(OTHER_LINEAGE, "9.0.0", ResolvedScope::PerUser)];
    let decision = resolve_install_mode(&package("0.2.0"), &others, SameVersionPolicy::Decline);

    assert_eq!(decision.mode, InstallMode::NoPriorInstall);
    assert_eq!(decision.action, ResolvedAction::FreshInstall);
    assert!(decision.related.is_empty());
    assert!(decision.proceeds());
}

#[test]
fn older_installed_version_is_upgraded() {
    let old = installed(LINEAGE, "0.1.0", ResolvedScope::PerUser);
    let decision = resolve_install_mode(
        &package("0.2.0"),
        std::slice::from_ref(&old),
        SameVersionPolicy::Decline,
    );

    assert_eq!(decision.mode, InstallMode::Upgrade);
    assert_eq!(
        decision.action,
        ResolvedAction::Upgrade {
            superseded: vec![old.clone()],
        }
    );
    assert_eq!(decision.replaced().to_vec(), vec![old]);
}

#[test]
fn equal_version_declines_by_default() {
    let current = installed(LINEAGE, "0.2", ResolvedScope::PerUser);
    let decision = resolve_install_mode(&package("0.2.0"), &[current], SameVersionPolicy::Decline);

    assert_eq!(decision.mode, InstallMode::SameVersion);
    assert!(!decision.proceeds());
    let reason = decision.declined().expect("declined");
    assert_eq!(reason.to_string(), "Tally 0.2 is already installed");
    assert!(decision.replaced().is_empty());
}

#[test]
fn equal_version_repairs_when_configured() {
    let current = installed(LINEAGE, "0.2.0", ResolvedScope::PerMachine);
    let decision = resolve_install_mode(
        &package("0.2.0"),
        std::slice::from_ref(&current),
        SameVersionPolicy::Repair,
    );

    assert_eq!(decision.mode, InstallMode::SameVersion);
    assert_eq!(
        decision.action,
        ResolvedAction::Repair {
            existing: vec![current],
        }
    );
}

#[test]
fn newer_installed_version_declines_with_product_message() {
    let newer = installed(LINEAGE, "0.2.0", ResolvedScope::PerUser);
    let decision = resolve_install_mode(&package("0.1.0"), &[newer], SameVersionPolicy::Repair);

    assert_eq!(decision.mode, InstallMode::Downgrade);
    match decision.declined() {
        Some(DeclineReason::Downgrade {
            installed,
            target,
            message,
        }) => {
            assert_eq!(installed.to_string(), "0.2.0");
            assert_eq!(target.to_string(), "0.1.0");
            assert_eq!(message, "A newer version of Tally is already installed.");
        }
        other => panic!("unexpected decline reason: {other:?}"),
    }
}

#[test]
fn highest_installed_version_decides() {
    let products = vec![
        installed(LINEAGE, "0.1.0", ResolvedScope::PerMachine),
        installed(LINEAGE, "0.3.0", ResolvedScope::PerUser),
    ];
    let decision = resolve_install_mode(&package("0.2.0"), &products, SameVersionPolicy::Decline);
    assert_eq!(decision.mode, InstallMode::Downgrade);

    let decision = resolve_install_mode(&package("1.0"), &products, SameVersionPolicy::Decline);
    assert_eq!(decision.mode, InstallMode::Upgrade);
    assert_eq!(
        decision
            .replaced()
            .iter()
            .map(|product| product.version.to_string())
            .collect::<Vec<_>>(),
        vec!["0.3.0", "0.1.0"]
    );
}

#[test]
fn upgrade_codes_match_regardless_of_case_and_braces() {
    let products = vec![
        installed(
            "{6f1c2a3b-1111-4222-8333-944455556666}",
            "0.1.0",
            ResolvedScope::PerUser,
        ),
        installed(OTHER_LINEAGE, "0.1.0", ResolvedScope::PerUser),
    ];
    let related = find_related_products(LINEAGE, &products);
    assert_eq!(related.len(), 1);
    assert_eq!(related[0].version, version("0.1"));
}
