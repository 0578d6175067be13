//! Submission requests
//!
//! A `SubmissionRequest` is produced by the dashboard forms and handed to the
//! orchestrator as-is. Nothing here talks to the portal.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::error::PortalError;

/// Scope of the HVAC work being permitted
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum InstallationType {
    CompleteSystem,
    CoolingOnly,
    HeatingOnly,
    Ductless,
    Other,
}

impl InstallationType {
    /// Option text the portal shows in its "Type of Work" dropdown
    pub fn portal_label(&self) -> &'static str {
        match self {
            InstallationType::CompleteSystem => "Replace Furnace and Air Conditioner",
            InstallationType::CoolingOnly => "Replace Air Conditioner",
            InstallationType::HeatingOnly => "Replace Furnace",
            InstallationType::Ductless => "Install Ductless Mini-Split",
            InstallationType::Other => "Other Mechanical",
        }
    }

    /// Default free-text scope when the request carries none
    pub fn default_description(&self) -> &'static str {
        match self {
            InstallationType::CompleteSystem => {
                "Like-for-like replacement of furnace and AC condenser in same location"
            }
            InstallationType::CoolingOnly => "Like-for-like replacement of AC condenser in same location",
            InstallationType::HeatingOnly => "Like-for-like replacement of furnace in same location",
            InstallationType::Ductless => "Install ductless mini-split heat pump system",
            InstallationType::Other => "Mechanical equipment replacement",
        }
    }
}

impl fmt::Display for InstallationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstallationType::CompleteSystem => write!(f, "complete-system"),
            InstallationType::CoolingOnly => write!(f, "cooling-only"),
            InstallationType::HeatingOnly => write!(f, "heating-only"),
            InstallationType::Ductless => write!(f, "ductless"),
            InstallationType::Other => write!(f, "other"),
        }
    }
}

/// Licensed contractor filing the permit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContractorInfo {
    pub company_name: String,
    pub license_number: String,
    /// License class as the portal lists it, e.g. "Mechanical Contractor"
    #[serde(default = "default_license_type")]
    pub license_type: String,
    pub contact_name: String,
    pub phone: String,
    pub email: String,
}

fn default_license_type() -> String {
    "Mechanical Contractor".into()
}

/// Normalized property address (already validated upstream)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PropertyAddress {
    pub street_number: String,
    pub street_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub unit: Option<String>,
    pub city: String,
    pub state: String,
    pub zip: String,
}

impl PropertyAddress {
    /// Partial address typed into the portal's autocomplete box.
    ///
    /// The portal's search matches poorly on full addresses, so only the
    /// house number and street name go in.
    pub fn search_text(&self) -> String {
        format!("{} {}", self.street_number.trim(), self.street_name.trim())
    }
}

impl fmt::Display for PropertyAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.search_text())?;
        if let Some(unit) = &self.unit {
            write!(f, " #{}", unit)?;
        }
        write!(f, ", {}, {} {}", self.city, self.state, self.zip)
    }
}

/// Equipment attributes, usually prefilled from nameplate OCR
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EquipmentDetails {
    pub manufacturer: String,
    pub model_number: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub serial_number: Option<String>,
    /// Cooling capacity in tons
    pub tonnage: f32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub btu_rating: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fuel_type: Option<String>,
}

/// Everything needed to file one permit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SubmissionRequest {
    /// Blank means "assign one when queued"
    #[serde(default)]
    pub submission_id: String,
    pub contractor: ContractorInfo,
    pub property: PropertyAddress,
    pub equipment: EquipmentDetails,
    /// Job valuation in dollars
    pub valuation: f64,
    pub installation_type: InstallationType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scope_description: Option<String>,
}

impl SubmissionRequest {
    /// Fill a blank submission id with a fresh UUID
    pub fn with_generated_id(mut self) -> Self {
        if self.submission_id.trim().is_empty() {
            self.submission_id = uuid::Uuid::new_v4().to_string();
        }
        self
    }

    /// Reject requests the portal would bounce anyway
    pub fn validate(&self) -> Result<(), PortalError> {
        let mut missing = Vec::new();
        if self.submission_id.trim().is_empty() {
            missing.push("submission id");
        }
        if self.contractor.license_number.trim().is_empty() {
            missing.push("contractor license number");
        }
        if self.property.street_number.trim().is_empty() || self.property.street_name.trim().is_empty() {
            missing.push("street address");
        }
        if !(self.equipment.tonnage > 0.0) {
            missing.push("equipment tonnage");
        }
        if !(self.valuation > 0.0) {
            missing.push("valuation");
        }

        if missing.is_empty() {
            Ok(())
        } else {
            Err(PortalError::InvalidRequest(format!("missing or invalid: {}", missing.join(", "))))
        }
    }

    pub fn description(&self) -> String {
        self.scope_description
            .clone()
            .filter(|s| !s.trim().is_empty())
            .unwrap_or_else(|| self.installation_type.default_description().to_string())
    }

    /// Valuation formatted the way the portal's currency inputs expect
    pub fn valuation_text(&self) -> String {
        format!("{:.2}", self.valuation)
    }

    /// Tonnage without a trailing ".0" for whole values
    pub fn tonnage_text(&self) -> String {
        let t = self.equipment.tonnage;
        if t.fract() == 0.0 {
            format!("{}", t as i64)
        } else {
            format!("{}", t)
        }
    }

    /// Short summary embedded in vision prompts
    pub fn prompt_summary(&self) -> String {
        format!(
            "Contractor: {} (license {}, {})\nContact: {} / {} / {}\nProperty: {}\nInstallation: {} ({})\n\
             Equipment: {} {} serial {} - {} tons{}{}\nValuation: ${}\nDescription: {}",
            self.contractor.company_name,
            self.contractor.license_number,
            self.contractor.license_type,
            self.contractor.contact_name,
            self.contractor.phone,
            self.contractor.email,
            self.property,
            self.installation_type,
            self.installation_type.portal_label(),
            self.equipment.manufacturer,
            self.equipment.model_number,
            self.equipment.serial_number.as_deref().unwrap_or("n/a"),
            self.tonnage_text(),
            self.equipment.btu_rating.map(|b| format!(", {} BTU", b)).unwrap_or_default(),
            self.equipment.fuel_type.as_ref().map(|f| format!(", fuel {}", f)).unwrap_or_default(),
            self.valuation_text(),
            self.description(),
        )
    }
}

#[cfg(test)]
pub(crate) fn sample_request(id: &str) -> SubmissionRequest {
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
