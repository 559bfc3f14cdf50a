//! Patient record store.
//!
//! Patients are keyed by an internal record id (`idFichaClinica`) and by their national ID.
//! Identity is immutable once created; demographic and contact fields change through
//! [`PatientPatch`] and the partial-update builder. Records are never deleted.

use crate::audit::{AuditAction, AuditEvent};
use crate::constants::{ADDRESS_MAX_LEN, NAME_MAX_LEN, SEARCH_LIMIT, SHORT_TEXT_MAX_LEN};
use crate::db::Store;
use crate::error::{is_unique_violation, EmrError, EmrResult};
use crate::update::{UpdateSet, Value};
use crate::validation::{capped, parse_date, present};
use chrono::{DateTime, Datelike, NaiveDate, Utc};
use emr_types::{NationalId, NonEmptyText};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Sex {
    #[serde(rename = "M")]
    Male,
    #[serde(rename = "F")]
    Female,
}

impl Sex {
    pub fn as_str(&self) -> &'static str {
        match self {
            Sex::Male => "M",
            Sex::Female => "F",
        }
    }
}

impl FromStr for Sex {
    type Err = EmrError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_uppercase().as_str() {
            "M" | "MASCULINO" => Ok(Sex::Male),
            "F" | "FEMENINO" => Ok(Sex::Female),
            _ => Err(EmrError::InvalidInput("sexo must be 'M' or 'F'".into())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Patient {
    #[serde(rename = "idFichaClinica")]
    pub id: i64,
    #[serde(rename = "dni")]
    pub national_id: String,
    #[serde(rename = "nombres")]
    pub first_names: String,
    #[serde(rename = "apellidoPaterno")]
    pub paternal_surname: String,
    #[serde(rename = "apellidoMaterno")]
    pub maternal_surname: Option<String>,
    #[serde(rename = "fechaNacimiento")]
    pub birth_date: NaiveDate,
    #[serde(rename = "edad")]
    pub age: u32,
    #[serde(rename = "sexo")]
    pub sex: Sex,
    #[serde(rename = "telefono")]
    pub phone: Option<String>,
    pub email: Option<String>,
    #[serde(rename = "direccion")]
    pub address: Option<String>,
    #[serde(rename = "distrito")]
    pub district: Option<String>,
    #[serde(rename = "provincia")]
    pub province: Option<String>,
    #[serde(rename = "departamento")]
    pub region: Option<String>,
    #[serde(rename = "ocupacion")]
    pub occupation: Option<String>,
    #[serde(rename = "fechaRegistro")]
    pub created_at: DateTime<Utc>,
    #[serde(rename = "fechaActualizacion")]
    pub updated_at: DateTime<Utc>,
}

impl Patient {
    pub fn full_name(&self) -> String {
        match &self.maternal_surname {
            Some(maternal) => format!(
                "{} {} {}",
                self.first_names, self.paternal_surname, maternal
            ),
            None => format!("{} {}", self.first_names, self.paternal_surname),
        }
    }
}

/// Completed years between `birth_date` and `today`.
pub fn age_on(birth_date: NaiveDate, today: NaiveDate) -> u32 {
    let mut years = today.year() - birth_date.year();
    if (today.month(), today.day()) < (birth_date.month(), birth_date.day()) {
        years -= 1;
    }
    years.max(0) as u32
}

#[derive(sqlx::FromRow)]
struct PatientRow {
    id: i64,
    national_id: String,
    first_names: String,
    paternal_surname: String,
    maternal_surname: Option<String>,
    birth_date: NaiveDate,
    sex: String,
    phone: Option<String>,
    email: Option<String>,
    address: Option<String>,
    district: Option<String>,
    province: Option<String>,
    region: Option<String>,
    occupation: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<PatientRow> for Patient {
    type Error = EmrError;

    fn try_from(row: PatientRow) -> Result<Self, Self::Error> {
        let sex = Sex::from_str(&row.sex)
            .map_err(|_| EmrError::CorruptRecord(format!("patient {} has sex '{}'", row.id, row.sex)))?;
        Ok(Patient {
            age: age_on(row.birth_date, Utc::now().date_naive()),
            id: row.id,
            national_id: row.national_id,
            first_names: row.first_names,
            paternal_surname: row.paternal_surname,
            maternal_surname: row.maternal_surname,
            birth_date: row.birth_date,
            sex,
            phone: row.phone,
            email: row.email,
            address: row.address,
            district: row.district,
            province: row.province,
            region: row.region,
            occupation: row.occupation,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const PATIENT_COLUMNS: &str = "id, national_id, first_names, paternal_surname, maternal_surname,
    birth_date, sex, phone, email, address, district, province, region, occupation,
    created_at, updated_at";

/// Input for registering a new patient.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewPatient {
    #[serde(rename = "dni")]
    pub national_id: String,
    #[serde(rename = "nombres")]
    pub first_names: String,
    #[serde(rename = "apellidoPaterno")]
    pub paternal_surname: String,
    #[serde(rename = "apellidoMaterno", default)]
    pub maternal_surname: Option<String>,
    #[serde(rename = "fechaNacimiento")]
    pub birth_date: String,
    #[serde(rename = "sexo")]
    pub sex: String,
    #[serde(rename = "telefono", default)]
    pub phone: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(rename = "direccion", default)]
    pub address: Option<String>,
    #[serde(rename = "distrito", default)]
    pub district: Option<String>,
    #[serde(rename = "provincia", default)]
    pub province: Option<String>,
    #[serde(rename = "departamento", default)]
    pub region: Option<String>,
    #[serde(rename = "ocupacion", default)]
    pub occupation: Option<String>,
}

/// Sparse patient edit. Absent fields are left untouched; `null` clears optional fields.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PatientPatch {
    #[serde(rename = "nombres", default)]
    pub first_names: Option<String>,
    #[serde(rename = "apellidoPaterno", default)]
    pub paternal_surname: Option<String>,
    #[serde(rename = "apellidoMaterno", default, deserialize_with = "present")]
    pub maternal_surname: Option<Option<String>>,
    #[serde(rename = "fechaNacimiento", default)]
    pub birth_date: Option<String>,
    #[serde(rename = "sexo", default)]
    pub sex: Option<String>,
    #[serde(rename = "telefono", default, deserialize_with = "present")]
    pub phone: Option<Option<String>>,
    #[serde(default, deserialize_with = "present")]
    pub email: Option<Option<String>>,
    #[serde(rename = "direccion", default, deserialize_with = "present")]
    pub address: Option<Option<String>>,
    #[serde(rename = "distrito", default, deserialize_with = "present")]
    pub district: Option<Option<String>>,
    #[serde(rename = "provincia", default, deserialize_with = "present")]
    pub province: Option<Option<String>>,
    #[serde(rename = "departamento", default, deserialize_with = "present")]
    pub region: Option<Option<String>>,
    #[serde(rename = "ocupacion", default, deserialize_with = "present")]
    pub occupation: Option<Option<String>>,
}

impl PatientPatch {
    fn into_update_set(self) -> UpdateSet {
        let mut set = UpdateSet::new("patients");
        set.required_text("first_names", "nombres", self.first_names, NAME_MAX_LEN)
            .required_text(
                "paternal_surname",
                "apellidoPaterno",
                self.paternal_surname,
                NAME_MAX_LEN,
            )
            .text(
                "maternal_surname",
                "apellidoMaterno",
                self.maternal_surname,
                NAME_MAX_LEN,
            )
            .text("phone", "telefono", self.phone, SHORT_TEXT_MAX_LEN)
            .text("email", "email", self.email, ADDRESS_MAX_LEN)
            .text("address", "direccion", self.address, ADDRESS_MAX_LEN)
            .text("district", "distrito", self.district, SHORT_TEXT_MAX_LEN)
            .text("province", "provincia", self.province, SHORT_TEXT_MAX_LEN)
            .text("region", "departamento", self.region, SHORT_TEXT_MAX_LEN)
            .text("occupation", "ocupacion", self.occupation, SHORT_TEXT_MAX_LEN);

        if let Some(raw) = self.birth_date {
            match parse_birth_date(&raw) {
                Ok(date) => {
                    set.set("birth_date", Value::Date(Some(date)));
                }
                Err(e) => {
                    set.reject(e.to_string());
                }
            }
        }
        if let Some(raw) = self.sex {
            match Sex::from_str(&raw) {
                Ok(sex) => {
                    set.set("sex", Value::Text(Some(sex.as_str().to_string())));
                }
                Err(e) => {
                    set.reject(e.to_string());
                }
            }
        }
        set
    }
}

fn parse_birth_date(raw: &str) -> EmrResult<NaiveDate> {
    let date = parse_date("fechaNacimiento", raw)?;
    if date > Utc::now().date_naive() {
        return Err(EmrError::InvalidInput(
            "fechaNacimiento cannot be in the future".into(),
        ));
    }
    Ok(date)
}

/// Pure patient data operations - no API concerns
#[derive(Clone, Debug)]
pub struct PatientService {
    store: Store,
}

impl PatientService {
    pub fn new(store: Store) -> Self {
        Self { store }
    }

    /// Registers a new patient.
    ///
    /// Over-long optional text is truncated to its cap rather than rejected.
    ///
    /// # Errors
    ///
    /// - [`EmrError::Validation`] listing every invalid required field.
    /// - [`EmrError::DuplicateNationalId`] if the national ID is already registered.
    pub async fn create(&self, actor_id: i64, input: NewPatient) -> EmrResult<Patient> {
        let mut errors = Vec::new();

        let national_id = NationalId::parse(&input.national_id)
            .map_err(|e| errors.push(format!("dni: {e}")))
            .ok();
        let first_names = NonEmptyText::new(&input.first_names)
            .map_err(|_| errors.push("nombres cannot be empty".to_string()))
            .ok();
        let paternal_surname = NonEmptyText::new(&input.paternal_surname)
            .map_err(|_| errors.push("apellidoPaterno cannot be empty".to_string()))
            .ok();
        let birth_date = parse_birth_date(&input.birth_date)
            .map_err(|e| errors.push(e.to_string()))
            .ok();
        let sex = Sex::from_str(&input.sex)
            .map_err(|e| errors.push(e.to_string()))
            .ok();

        let (Some(national_id), Some(first_names), Some(paternal_surname), Some(birth_date), Some(sex)) =
            (national_id, first_names, paternal_surname, birth_date, sex)
        else {
            return Err(EmrError::Validation(errors));
        };

        let now = Utc::now();
        let result = sqlx::query(
            "INSERT INTO patients (national_id, first_names, paternal_surname, maternal_surname,
             birth_date, sex, phone, email, address, district, province, region, occupation,
             created_at, updated_at)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(national_id.as_str())
        .bind(crate::validation::truncate(first_names.as_str(), NAME_MAX_LEN))
        .bind(crate::validation::truncate(paternal_surname.as_str(), NAME_MAX_LEN))
        .bind(capped(input.maternal_surname, NAME_MAX_LEN))
        .bind(birth_date)
        .bind(sex.as_str())
        .bind(capped(input.phone, SHORT_TEXT_MAX_LEN))
        .bind(capped(input.email, ADDRESS_MAX_LEN))
        .bind(capped(input.address, ADDRESS_MAX_LEN))
        .bind(capped(input.district, SHORT_TEXT_MAX_LEN))
        .bind(capped(input.province, SHORT_TEXT_MAX_LEN))
        .bind(capped(input.region, SHORT_TEXT_MAX_LEN))
        .bind(capped(input.occupation, SHORT_TEXT_MAX_LEN))
        .bind(now)
        .bind(now)
        .execute(self.store.pool())
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                EmrError::DuplicateNationalId
            } else {
                EmrError::Database(e)
            }
        })?;

        let id = result.last_insert_rowid();
        tracing::info!(patient_id = id, "patient registered");
        self.store
            .audit()
            .emit(AuditEvent::new(actor_id, AuditAction::PatientCreated, "patient", id));

        self.get(id).await
    }

    /// Fetches a patient by record id.
    pub async fn get(&self, id: i64) -> EmrResult<Patient> {
        self.find(id).await?.ok_or(EmrError::PatientNotFound)
    }

    /// Fetches a patient by record id, returning `None` when absent.
    pub async fn find(&self, id: i64) -> EmrResult<Option<Patient>> {
        let row: Option<PatientRow> =
            sqlx::query_as(&format!("SELECT {PATIENT_COLUMNS} FROM patients WHERE id = ?"))
                .bind(id)
                .fetch_optional(self.store.pool())
                .await?;
        row.map(Patient::try_from).transpose()
    }

    /// Fetches a patient by national ID.
    pub async fn get_by_national_id(&self, national_id: &NationalId) -> EmrResult<Patient> {
        let row: Option<PatientRow> = sqlx::query_as(&format!(
            "SELECT {PATIENT_COLUMNS} FROM patients WHERE national_id = ?"
        ))
        .bind(national_id.as_str())
        .fetch_optional(self.store.pool())
        .await?;
        row.map(Patient::try_from)
            .transpose()?
            .ok_or(EmrError::PatientNotFound)
    }

    /// Searches patients by national-ID prefix or by any name part.
    ///
    /// With no query the most recently registered patients are returned.
    pub async fn search(&self, query: Option<&str>) -> EmrResult<Vec<Patient>> {
        let term = query.map(str::trim).filter(|q| !q.is_empty());
        let rows: Vec<PatientRow> = match term {
            Some(term) => {
                let prefix = format!("{term}%");
                let contains = format!("%{term}%");
                sqlx::query_as(&format!(
                    "SELECT {PATIENT_COLUMNS} FROM patients
                     WHERE national_id LIKE ?
                        OR first_names LIKE ?
                        OR paternal_surname LIKE ?
                        OR maternal_surname LIKE ?
                     ORDER BY paternal_surname, first_names
                     LIMIT ?"
                ))
                .bind(prefix)
                .bind(&contains)
                .bind(&contains)
                .bind(&contains)
                .bind(SEARCH_LIMIT)
                .fetch_all(self.store.pool())
                .await?
            }
            None => {
                sqlx::query_as(&format!(
                    "SELECT {PATIENT_COLUMNS} FROM patients ORDER BY id DESC LIMIT ?"
                ))
                .bind(SEARCH_LIMIT)
                .fetch_all(self.store.pool())
                .await?
            }
        };
        rows.into_iter().map(Patient::try_from).collect()
    }

    /// Applies a sparse edit to a patient.
    ///
    /// # Errors
    ///
    /// - [`EmrError::NoFieldsToUpdate`] when the patch names no recognised field.
    /// - [`EmrError::Validation`] when any present field is invalid or over its cap.
    /// - [`EmrError::PatientNotFound`] when the record does not exist.
    pub async fn update(&self, actor_id: i64, id: i64, patch: PatientPatch) -> EmrResult<Patient> {
        let pending = patch.into_update_set().build()?;
        let columns = pending.columns().join(",");
        let affected = pending.execute(self.store.pool(), "id", id).await?;
        if affected == 0 {
            return Err(EmrError::PatientNotFound);
        }

        self.store.audit().emit(
            AuditEvent::new(actor_id, AuditAction::PatientUpdated, "patient", id)
                .with_detail(Some(columns)),
        );
        self.get(id).await
    }
}
