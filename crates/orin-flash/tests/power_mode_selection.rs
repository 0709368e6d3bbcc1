use orin_flash::power::{ModeSelection, select_highest_power_mode};

const NVPMODEL_LISTING: &str = "\
NV Power Mode: MODE_15W
POWER MODEL: Mode 0 (7W)
POWER MODEL: Mode 1 (15W)
POWER MODEL: Mode 2 (25W MAXN SUPER)
";

#[test]
fn selects_the_super_mode_from_a_devkit_listing() {
    let sel = select_highest_power_mode(NVPMODEL_LISTING).expect("selection");
    assert_eq!(sel.id, 2);
    assert_eq!(sel.watts, Some(25.0));
}

#[test]
fn selection_is_stable_across_repeated_scans() {
    let first = select_highest_power_mode(NVPMODEL_LISTING);
    let second = select_highest_power_mode(NVPMODEL_LISTING);
    assert_eq!(first, second);
}

#[test]
fn equal_wattages_resolve_to_the_later_mode() {
    let listing = "Mode 0: 7W\nMode 1: 15W\nMode 2: 15W\n";
    assert_eq!(
        select_highest_power_mode(listing),
        Some(ModeSelection {
            id: 2,
            watts: Some(15.0)
        })
    );
}

#[test]
fn listings_without_wattage_fall_back_to_the_last_mode() {
    let listing = "Mode 0 MAXN\nMode 1 LOW\n";
    assert_eq!(
        select_highest_power_mode(listing),
        Some(ModeSelection {
            id: 1,
            watts: None
        })
    );
}

#[test]
fn undecidable_listings_are_a_soft_failure() {
    // No mode line at all means the caller leaves the device at its default
    // power mode rather than failing the run.
    assert_eq!(select_highest_power_mode(""), None);
    assert_eq!(select_highest_power_mode("nvpmodel: command garbage 15W"), None);
}
