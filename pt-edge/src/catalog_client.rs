use std::{sync::Arc, time::Duration};

use reqwest::header;
use runner_abi::{ExecutionMode, ExecutionStage, ImageKind};
use serde_json::Value;
use thiserror::Error;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    catalog::{
        AssemblyRecord, CatalogSnapshot, ImageRecord, StepRecord, TypeRecord, parse_field_list,
    },
    logging::category_catalog,
    model::{CredentialStore, DEFAULT_API_VERSION},
};

const ASSEMBLIES_QUERY: &str =
    "pluginassemblies?$select=pluginassemblyid,name,version,isolationmode,ismanaged";
const TYPES_QUERY: &str =
    "plugintypes?$select=plugintypeid,name,typename,assemblyname,_pluginassemblyid_value";
const STEPS_QUERY: &str = concat!(
    "sdkmessageprocessingsteps?$select=sdkmessageprocessingstepid,name,stage,mode,rank,",
    "filteringattributes,configuration,_eventhandler_value",
    "&$filter=statecode eq 0",
    "&$expand=sdkmessageid($select=name),sdkmessagefilterid($select=primaryobjecttypecode),",
    "sdkmessageprocessingstepsecureconfigid($select=secureconfig)"
);
const IMAGES_QUERY: &str = concat!(
    "sdkmessageprocessingstepimages?$select=sdkmessageprocessingstepimageid,imagetype,",
    "entityalias,attributes,_sdkmessageprocessingstepid_value"
);
const DEFAULT_PAGE_SIZE: u32 = 500;
const SANDBOX_ISOLATION_MODE: i64 = 2;

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum CatalogFetchError {
    #[error("no org credentials configured")]
    NoCredentials,
    #[error("catalog request failed: {0}")]
    Transport(String),
    #[error("catalog request {url} returned status {status}")]
    Status { url: String, status: u16 },
    #[error("catalog response is not a collection: {0}")]
    Decode(String),
}

/// Reads the registration catalog through the platform web api.
pub struct CatalogClient {
    client: reqwest::Client,
    credentials: Arc<CredentialStore>,
    api_version: String,
    page_size: u32,
}

impl CatalogClient {
    pub fn new(credentials: Arc<CredentialStore>, timeout: Duration) -> Result<Self, reqwest::Error> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self {
            client,
            credentials,
            api_version: DEFAULT_API_VERSION.to_string(),
            page_size: DEFAULT_PAGE_SIZE,
        })
    }

    pub fn with_page_size(mut self, page_size: u32) -> Self {
        self.page_size = page_size.max(1);
        self
    }

    pub async fn fetch_snapshot(&self) -> Result<CatalogSnapshot, CatalogFetchError> {
        let assemblies = self.fetch_all(ASSEMBLIES_QUERY).await?;
        let types = self.fetch_all(TYPES_QUERY).await?;
        let steps = self.fetch_all(STEPS_QUERY).await?;
        let images = self.fetch_all(IMAGES_QUERY).await?;
        info!(
            "{} fetched assemblies={} types={} steps={} images={}",
            category_catalog(),
            assemblies.len(),
            types.len(),
            steps.len(),
            images.len()
        );

        Ok(CatalogSnapshot::from_records(
            rows_to_records(&assemblies, assembly_from_row, "assembly"),
            rows_to_records(&types, type_from_row, "type"),
            rows_to_records(&steps, step_from_row, "step"),
            rows_to_records(&images, image_from_row, "image"),
        ))
    }

    /// Follows `@odata.nextLink` until the collection is exhausted.
    async fn fetch_all(&self, query: &str) -> Result<Vec<Value>, CatalogFetchError> {
        let credentials = self
            .credentials
            .get()
            .ok_or(CatalogFetchError::NoCredentials)?;
        let mut next = Some(credentials.api_url(&self.api_version, query));
        let mut rows = Vec::new();

        while let Some(url) = next.take() {
            debug!("{} GET {url}", category_catalog());
            let response = self
                .client
                .get(&url)
                .header(header::AUTHORIZATION, credentials.bearer())
                .header(header::ACCEPT, "application/json")
                .header("OData-MaxVersion", "4.0")
                .header("OData-Version", "4.0")
                .header("Prefer", format!("odata.maxpagesize={}", self.page_size))
                .send()
                .await
                .map_err(|err| CatalogFetchError::Transport(err.to_string()))?;
            if !response.status().is_success() {
                return Err(CatalogFetchError::Status {
                    url,
                    status: response.status().as_u16(),
                });
            }
            let page: Value = response
                .json()
                .await
                .map_err(|err| CatalogFetchError::Decode(err.to_string()))?;
            let Some(values) = page.get("value").and_then(Value::as_array) else {
                return Err(CatalogFetchError::Decode(url));
            };
            rows.extend(values.iter().cloned());
            next = page
                .get("@odata.nextLink")
                .and_then(Value::as_str)
                .map(str::to_string);
        }
        Ok(rows)
    }
}

fn rows_to_records<T>(rows: &[Value], convert: fn(&Value) -> Option<T>, kind: &str) -> Vec<T> {
    let records: Vec<T> = rows.iter().filter_map(convert).collect();
    if records.len() < rows.len() {
        warn!(
            "{} skipped {} unreadable {kind} rows",
            category_catalog(),
            rows.len() - records.len()
        );
    }
    records
}

fn uuid_field(row: &Value, name: &str) -> Option<Uuid> {
    row.get(name)?.as_str()?.parse().ok()
}

fn str_field(row: &Value, name: &str) -> Option<String> {
    row.get(name)?
        .as_str()
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}

fn int_field(row: &Value, name: &str) -> Option<i64> {
    row.get(name)?.as_i64()
}

pub fn assembly_from_row(row: &Value) -> Option<AssemblyRecord> {
    Some(AssemblyRecord {
        id: uuid_field(row, "pluginassemblyid")?,
        name: str_field(row, "name")?,
        version: str_field(row, "version").unwrap_or_default(),
        sandboxed: int_field(row, "isolationmode") == Some(SANDBOX_ISOLATION_MODE),
        managed: row
            .get("ismanaged")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

pub fn type_from_row(row: &Value) -> Option<TypeRecord> {
    Some(TypeRecord {
        id: uuid_field(row, "plugintypeid")?,
        name: str_field(row, "name").unwrap_or_default(),
        type_name: str_field(row, "typename")?,
        assembly_id: uuid_field(row, "_pluginassemblyid_value")?,
        assembly_name: str_field(row, "assemblyname").unwrap_or_default(),
    })
}

pub fn step_from_row(row: &Value) -> Option<StepRecord> {
    let message = row.get("sdkmessageid")?;
    let entity = row
        .get("sdkmessagefilterid")
        .and_then(|filter| str_field(filter, "primaryobjecttypecode"))
        .unwrap_or_default();
    let secure_config = row
        .get("sdkmessageprocessingstepsecureconfigid")
        .and_then(|config| str_field(config, "secureconfig"));
    Some(StepRecord {
        id: uuid_field(row, "sdkmessageprocessingstepid")?,
        type_id: uuid_field(row, "_eventhandler_value")?,
        name: str_field(row, "name").unwrap_or_default(),
        operation: str_field(message, "name")?,
        entity: entity.to_ascii_lowercase(),
        stage: ExecutionStage::from_code(int_field(row, "stage")?)?,
        mode: ExecutionMode::from_code(int_field(row, "mode").unwrap_or(0)),
        rank: int_field(row, "rank")
            .and_then(|rank| i32::try_from(rank).ok())
            .unwrap_or(1),
        filtering_fields: str_field(row, "filteringattributes")
            .map(|raw| parse_field_list(&raw))
            .unwrap_or_default(),
        secure_config,
        unsecure_config: str_field(row, "configuration"),
    })
}

pub fn image_from_row(row: &Value) -> Option<ImageRecord> {
    Some(ImageRecord {
        id: uuid_field(row, "sdkmessageprocessingstepimageid")?,
        step_id: uuid_field(row, "_sdkmessageprocessingstepid_value")?,
        kind: ImageKind::from_code(int_field(row, "imagetype")?)?,
        alias: str_field(row, "entityalias")?,
        fields: str_field(row, "attributes")
            .map(|raw| parse_field_list(&raw))
            .unwrap_or_default(),
    })
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    const STEP_ID: &str = "22222222-2222-2222-2222-222222222222";
    const TYPE_ID: &str = "33333333-3333-3333-3333-333333333333";

    #[test]
    fn step_rows_expand_message_filter_and_secure_config() {
        let row = json!({
            "sdkmessageprocessingstepid": STEP_ID,
            "_eventhandler_value": TYPE_ID,
            "name": "Contoso.Plugins.AccountUpdate: Update of account",
            "stage": 20,
            "mode": 1,
            "rank": 5,
            "filteringattributes": "Name, telephone1",
            "configuration": "unsecure",
            "sdkmessageid": { "name": "Update" },
            "sdkmessagefilterid": { "primaryobjecttypecode": "Account" },
            "sdkmessageprocessingstepsecureconfigid": { "secureconfig": "secret" }
        });

        let step = step_from_row(&row).expect("row should convert");
        assert_eq!(step.operation, "Update");
        assert_eq!(step.entity, "account");
        assert_eq!(step.stage, ExecutionStage::PreOperation);
        assert_eq!(step.mode, ExecutionMode::Asynchronous);
        assert_eq!(step.rank, 5);
        assert_eq!(step.filtering_fields, vec!["name", "telephone1"]);
        assert_eq!(step.secure_config.as_deref(), Some("secret"));
        assert_eq!(step.unsecure_config.as_deref(), Some("unsecure"));
    }

    #[test]
    fn step_rows_without_filter_target_any_entity() {
        let row = json!({
            "sdkmessageprocessingstepid": STEP_ID,
            "_eventhandler_value": TYPE_ID,
            "stage": 40,
            "sdkmessageid": { "name": "new_Calculate" },
            "sdkmessagefilterid": null,
            "sdkmessageprocessingstepsecureconfigid": null
        });

        let step = step_from_row(&row).expect("row should convert");
        assert_eq!(step.entity, "");
        assert_eq!(step.mode, ExecutionMode::Synchronous);
        assert!(step.filtering_fields.is_empty());
        assert!(step.secure_config.is_none());
    }

    #[test]
    fn rows_with_unknown_stage_or_image_type_are_skipped() {
        let step = json!({
            "sdkmessageprocessingstepid": STEP_ID,
            "_eventhandler_value": TYPE_ID,
            "stage": 15,
            "sdkmessageid": { "name": "Update" }
        });
        assert!(step_from_row(&step).is_none());

        let image = json!({
            "sdkmessageprocessingstepimageid": TYPE_ID,
            "_sdkmessageprocessingstepid_value": STEP_ID,
            "imagetype": 9,
            "entityalias": "PreImage"
        });
        assert!(image_from_row(&image).is_none());
        assert!(rows_to_records(&[image], image_from_row, "image").is_empty());
    }

    #[test]
    fn assembly_and_type_rows_convert() {
        let assembly = assembly_from_row(&json!({
            "pluginassemblyid": TYPE_ID,
            "name": "Contoso.Plugins",
            "version": "1.0.0.0",
            "isolationmode": 2,
            "ismanaged": false
        }))
        .expect("assembly should convert");
        assert!(assembly.sandboxed);

        let plugin_type = type_from_row(&json!({
            "plugintypeid": STEP_ID,
            "typename": "Contoso.Plugins.AccountUpdate",
            "_pluginassemblyid_value": TYPE_ID
        }))
        .expect("type should convert");
        assert_eq!(plugin_type.assembly_id, assembly.id);
        assert_eq!(plugin_type.assembly_name, "");
    }
}
