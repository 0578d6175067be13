//! Shared fixtures for the integration tests

#![allow(dead_code)]

use std::sync::Arc;

use permit_pilot::browser::fixture::{Effect, FixtureElement, FixturePage, FixtureScreen};
use permit_pilot::core::{
    ContractorInfo, EquipmentDetails, InstallationType, OrchestratorConfig, PropertyAddress, SubmissionRequest,
    TimingPolicy,
};
use permit_pilot::logging::SystemLogger;
use permit_pilot::orchestrator::{SqliteCheckpointStore, StaticAnalyzer, StepSequencer};

pub const PERMIT: &str = "MEC-2025-000311";

pub fn request(id: &str) -> SubmissionRequest {
    SubmissionRequest {
        submission_id: id.into(),
        contractor: ContractorInfo {
            company_name: "Cool Breeze HVAC LLC".into(),
            license_number: "CMC1250099".into(),
            license_type: "Mechanical Contractor".into(),
            contact_name: "Dana Ortiz".into(),
            phone: "555-201-3344".into(),
            email: "permits@coolbreeze.example".into(),
        },
        property: PropertyAddress {
            street_number: "1420".into(),
            street_name: "Palm Ridge Dr".into(),
            unit: None,
            city: "Oakdale".into(),
            state: "FL".into(),
            zip: "33410".into(),
        },
        equipment: EquipmentDetails {
            manufacturer: "Carrier".into(),
            model_number: "24ACC636A003".into(),
            serial_number: Some("2519E12345".into()),
            tonnage: 3.0,
            btu_rating: Some(36000),
            fuel_type: None,
        },
        valuation: 8450.0,
        installation_type: InstallationType::CompleteSystem,
        scope_description: None,
    }
}

/// Default config with fixture timings and a throwaway artifacts dir
pub fn config(artifacts: &tempfile::TempDir) -> OrchestratorConfig {
    let mut config = OrchestratorConfig::default();
    config.timing = TimingPolicy::fast();
    config.storage.artifacts_dir = artifacts.path().to_path_buf();
    config.batch.cooldown_secs = 0;
    config
}

pub fn sequencer(config: OrchestratorConfig) -> StepSequencer {
    StepSequencer::new(
        config,
        Arc::new(SqliteCheckpointStore::open_memory().unwrap()),
        Arc::new(StaticAnalyzer::disabled()),
        Arc::new(SystemLogger::console_only()),
    )
}

fn continue_btn() -> FixtureElement {
    FixtureElement::button("Continue Application »").on_click(Effect::Advance)
}

/// The whole wizard as the portal serves it, ending on the fee page and
/// the contractor's record list with its record pages
pub fn portal_screens() -> Vec<FixtureScreen> {
    let portal = OrchestratorConfig::default().portal;
    vec![
        FixtureScreen::new("home", &portal.start_url(), "Building Permits\nCreate and track applications")
            .with(FixtureElement::link("Create an Application").on_click(Effect::Advance)),
        FixtureScreen::new("terms", "https://portal.test/terms", "General Disclaimer")
            .with(FixtureElement::checkbox("I have read and accepted the above terms"))
            .with(continue_btn()),
        FixtureScreen::new("record-type", "https://portal.test/type", "Select a Record Type")
            .with(FixtureElement::checkbox("Mechanical Express Permit"))
            .with(FixtureElement::checkbox("Building Alteration"))
            .with(continue_btn()),
        FixtureScreen::new("address", "https://portal.test/address", "Property Address\nSearch by street")
            .with(
                FixtureElement::input("Property Address")
                    .on_input(Effect::Reveal("results".into()))
                    .on_input(Effect::ShowOverlay("pendo-guide".into())),
            )
            .with(
                FixtureElement::new("option", "1420 PALM RIDGE DR, OAKDALE FL 33410")
                    .selector(".address-search-results .result-row")
                    .hidden_in("results")
                    .at(100.0, 300.0, 400.0, 30.0)
                    .on_click(Effect::AppendText("Selected: 1420 PALM RIDGE DR".into())),
            )
            .with(continue_btn()),
        FixtureScreen::new("contractor", "https://portal.test/contractor", "Licensed Professional")
            .with(FixtureElement::select("License Type", &["General Contractor", "Mechanical Contractor"]))
            .with(FixtureElement::input("License Number"))
            .with(FixtureElement::button("Look Up").on_click(Effect::AppendText("Cool Breeze HVAC LLC".into())))
            .with(continue_btn()),
        FixtureScreen::new("applicant", "https://portal.test/applicant", "Applicant")
            .with(FixtureElement::input("Contact Name"))
            .with(FixtureElement::input("Phone Number"))
            .with(FixtureElement::input("Email Address"))
            .with(continue_btn()),
        FixtureScreen::new("scope", "https://portal.test/scope", "Project Description")
            .with(FixtureElement::select(
                "Type of Work",
                &["Replace Air Conditioner", "Replace Furnace and Air Conditioner"],
            ))
            .with(FixtureElement::input("Project Description"))
            .with(continue_btn()),
        FixtureScreen::new("equipment", "https://portal.test/equipment", "Equipment Information")
            .with(FixtureElement::input("Manufacturer"))
            .with(FixtureElement::input("Model Number"))
            .with(FixtureElement::input("Tonnage"))
            .with(FixtureElement::input("Serial Number"))
            .with(FixtureElement::input("BTU Rating"))
            .with(continue_btn()),
        FixtureScreen::new("work", "https://portal.test/work", "Work Items")
            .with(FixtureElement::input("Job Value"))
            .with(continue_btn()),
        FixtureScreen::new("documents", "https://portal.test/documents", "Documents\nNo plans required for this record type")
            .with(continue_btn()),
        FixtureScreen::new("review", "https://portal.test/review", "Review your application before submitting")
            .with(FixtureElement::button("Submit Application").on_click(Effect::Advance)),
        FixtureScreen::new(
            "payment",
            "https://aca-prod.accela.com/OAKDALE/Cap/CapPayment.aspx?module=Building",
            &format!("Pay Fees\nRecord {}\nAmount Due: $142.50", PERMIT),
        ),
        FixtureScreen::new(
            "records",
            &portal.records_url(),
            &format!(
                "My Records\n\
                 MEC-2025-000100  Mechanical Express Permit  77 Bayshore Ave  Issued\n\
                 {}  Mechanical Express Permit  1420 Palm Ridge Dr  Issued",
                PERMIT
            ),
        )
        .with(FixtureElement::link("MEC-2025-000100").on_click(Effect::GoTo("other-record".into())))
        .with(FixtureElement::link(PERMIT).on_click(Effect::GoTo("record".into()))),
        FixtureScreen::new(
            "other-record",
            "https://portal.test/Cap/CapDetail.aspx?id=100",
            "Record MEC-2025-000100\nStatus: Issued",
        ),
        FixtureScreen::new(
            "record",
            "https://portal.test/Cap/CapDetail.aspx?id=311",
            &format!("Record {}\nMechanical Express Permit\nStatus: Issued", PERMIT),
        ),
    ]
}

/// Fresh portal on its start page
pub fn portal() -> FixturePage {
    FixturePage::new(portal_screens()).on_script("guidance overlay cleanup", vec![Effect::ClearOverlay])
}
