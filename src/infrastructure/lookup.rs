//! Patient lookup against the hospital records service.
//!
//! The stored credential pair doubles as the query: `admin_key` selects the
//! hospital and `search_text` the patient.

use crate::domain::models::CredentialPair;
use crate::domain::patient::{Patient, PatientResponse};
use crate::domain::settings::Settings;
use std::time::Duration;
use thiserror::Error;
use tracing::{debug, info, warn};

pub const PATIENT_LIST_PATH: &str = "987ZkV2inxuw/get_patient_list_history_ipd_opd.php";

#[derive(Debug, Error)]
pub enum LookupError {
    #[error("Admin Key and Search Text must both be stored before a lookup")]
    MissingCredentials,

    #[error("Lookup request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Lookup service returned HTTP {0}: {1}")]
    Status(u16, String),
}

pub struct PatientApiClient {
    client: reqwest::Client,
    endpoint: String,
}

impl PatientApiClient {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self, LookupError> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            endpoint: endpoint_url(base_url),
        })
    }

    pub fn from_settings(settings: &Settings) -> Result<Self, LookupError> {
        Self::new(&settings.lookup_base_url, settings.lookup_timeout())
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// POST the pair as a form and return the matching patients.
    pub async fn fetch_patients(
        &self,
        credentials: &CredentialPair,
    ) -> Result<Vec<Patient>, LookupError> {
        let (admin_key, search_text) = match (&credentials.admin_key, &credentials.search_text) {
            (Some(admin_key), Some(search_text)) if credentials.is_complete() => {
                (admin_key.as_str(), search_text.as_str())
            }
            _ => return Err(LookupError::MissingCredentials),
        };

        info!(endpoint = %self.endpoint, "Requesting patient list");
        let response = self
            .client
            .post(&self.endpoint)
            .form(&[("admin_key", admin_key), ("search_text", search_text)])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!(status = status.as_u16(), "Patient lookup rejected");
            return Err(LookupError::Status(status.as_u16(), body));
        }

        let patients = response.json::<PatientResponse>().await?.into_patients();
        debug!(count = patients.len(), "Patient lookup finished");
        Ok(patients)
    }
}

fn endpoint_url(base_url: &str) -> String {
    format!("{}/{}", base_url.trim_end_matches('/'), PATIENT_LIST_PATH)
}
