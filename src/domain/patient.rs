use serde::{Deserialize, Deserializer, Serialize};

/// One record returned by the patient lookup service.
///
/// The service leaves unknown fields out or sends them as `null`; both read
/// as an empty string.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Patient {
    #[serde(deserialize_with = "null_as_empty")]
    pub hospital_id: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub patient_id: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub ipd_number: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub opd_number: String,
    #[serde(rename = "patient_name", deserialize_with = "null_as_empty")]
    pub name: String,
    #[serde(rename = "contact_no", deserialize_with = "null_as_empty")]
    pub contact_number: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub email: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub gender: String,
    #[serde(rename = "patient_age", deserialize_with = "null_as_empty")]
    pub age: String,
    #[serde(rename = "patient_dob", deserialize_with = "null_as_empty")]
    pub dob: String,
    #[serde(deserialize_with = "null_as_empty")]
    pub address: String,
}

fn null_as_empty<'de, D: Deserializer<'de>>(deserializer: D) -> Result<String, D::Error> {
    Ok(Option::<String>::deserialize(deserializer)?.unwrap_or_default())
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientResponse {
    #[serde(default)]
    pub data: Option<Vec<Patient>>,
}

impl PatientResponse {
    pub fn into_patients(self) -> Vec<Patient> {
        self.data.unwrap_or_default()
    }
}
