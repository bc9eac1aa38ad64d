// Property resolution against the daemon's bulk queries
//
// Manager properties come back flat (`a{sv}`); technologies and services come
// back indexed by object path (`a(oa{sv})`).
use connman_proto::{ObjectList, PropertyMap, Value};
use tracing::debug;

use crate::call::{require_target, CallGateway, Category};
use crate::{ConnmanError, Result};

#[derive(Clone)]
pub struct PropertyResolver {
    gateway: CallGateway,
}

impl PropertyResolver {
    pub fn new(gateway: CallGateway) -> Self {
        Self { gateway }
    }

    /// Runs the category's bulk query on the manager and returns the raw
    /// reply body.
    pub async fn get_bulk(&self, category: Category) -> Result<Vec<Value>> {
        self.gateway
            .call(Category::Manager, None, category.bulk_method(), vec![])
            .await
    }

    /// All technologies or services with their properties.
    pub async fn list(&self, category: Category) -> Result<ObjectList> {
        let body = self.get_bulk(category).await?;
        body.first()
            .and_then(ObjectList::from_value)
            .ok_or_else(|| unexpected_reply(category))
    }

    /// Manager properties.
    pub async fn manager_properties(&self) -> Result<PropertyMap> {
        let body = self.get_bulk(Category::Manager).await?;
        body.first()
            .and_then(Value::as_dict)
            .cloned()
            .ok_or_else(|| unexpected_reply(Category::Manager))
    }

    /// Looks up one property. For technologies and services the target
    /// object must appear in the bulk reply and carry `name`.
    pub async fn get_named(
        &self,
        category: Category,
        target: Option<&str>,
        name: &str,
    ) -> Result<Value> {
        let found = match category {
            Category::Manager => {
                let props = self.manager_properties().await?;
                props.get(name).cloned()
            }
            Category::Technology | Category::Service => {
                let target = require_target(category, target)?;
                let path = category.object_path(Some(target))?;
                let list = self.list(category).await?;
                list.get(&path).and_then(|props| props.get(name)).cloned()
            }
        };

        match found {
            Some(value) => {
                debug!(target: "connman::properties", %category, name, %value, "property resolved");
                Ok(value)
            }
            None => Err(ConnmanError::BadProperty(format!(
                "Bad property '{}' on {}",
                name,
                describe(category, target)
            ))),
        }
    }

    /// Sends `SetProperty(name, value)` to the addressed object.
    pub async fn set_named(
        &self,
        category: Category,
        target: Option<&str>,
        name: &str,
        value: Value,
    ) -> Result<()> {
        self.gateway
            .call(category, target, "SetProperty", vec![Value::from(name), value])
            .await?;
        Ok(())
    }
}

fn describe(category: Category, target: Option<&str>) -> String {
    match (category, target) {
        (Category::Manager, _) | (_, None) => category.to_string(),
        (_, Some(target)) => format!("{}/{}", category, target),
    }
}

fn unexpected_reply(category: Category) -> ConnmanError {
    ConnmanError::BadProperty(format!(
        "Unexpected {} reply from {}",
        category.bulk_method(),
        category
    ))
}
