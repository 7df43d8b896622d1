//! OpenAPI aggregation.
//!
//! Builds one OpenAPI 3 document out of every plugin's registered contract.
//! Each operation carries an `x-orpc-meta` extension with its admitted user
//! type and required (namespaced) access rules; paths are prefixed with
//! `/api` and the plugin mount.

use serde_json::{json, Map, Value};

use crate::plugin::RouterContract;

/// Build the aggregated spec from `(plugin_id, contract)` pairs.
pub fn build_spec(
    title: &str,
    version: &str,
    contracts: &[(String, RouterContract)],
) -> Value {
    let mut paths: Map<String, Value> = Map::new();

    for (plugin_id, contract) in contracts {
        for operation in &contract.operations {
            let full_path = format!("/api/{}{}", plugin_id, operation.path);
            let method = operation.method.to_lowercase();

            let access_rules: Vec<String> = operation
                .access_rules
                .iter()
                .map(|local| format!("{plugin_id}.{local}"))
                .collect();

            let mut op = json!({
                "operationId": operation.operation_id,
                "tags": [plugin_id],
                "responses": {
                    "200": { "description": "Success" }
                },
                "x-orpc-meta": {
                    "userType": operation.user_type,
                    "accessRules": access_rules,
                },
            });
            if let Some(description) = &operation.description {
                op["description"] = json!(description);
            }

            paths
                .entry(full_path)
                .or_insert_with(|| Value::Object(Map::new()))
                .as_object_mut()
                .expect("path entry is an object")
                .insert(method, op);
        }
    }

    json!({
        "openapi": "3.1.0",
        "info": {
            "title": title,
            "version": version,
        },
        "paths": Value::Object(paths),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plugin::{OperationSpec, UserType};

    fn contract() -> RouterContract {
        RouterContract {
            operations: vec![
                OperationSpec {
                    operation_id: "listWidgets".into(),
                    method: "GET".into(),
                    path: "/widgets".into(),
                    description: Some("List widgets".into()),
                    user_type: UserType::Any,
                    access_rules: vec!["read".into()],
                },
                OperationSpec {
                    operation_id: "createWidget".into(),
                    method: "POST".into(),
                    path: "/widgets".into(),
                    description: None,
                    user_type: UserType::User,
                    access_rules: vec!["manage".into()],
                },
            ],
        }
    }

    #[test]
    fn paths_are_prefixed_and_grouped_by_method() {
        let spec = build_spec("Test", "1.0.0", &[("widgets".into(), contract())]);
        let path = &spec["paths"]["/api/widgets/widgets"];
        assert!(path.get("get").is_some());
        assert!(path.get("post").is_some());
    }

    #[test]
    fn operations_carry_namespaced_rule_metadata() {
        let spec = build_spec("Test", "1.0.0", &[("widgets".into(), contract())]);
        let meta = &spec["paths"]["/api/widgets/widgets"]["get"]["x-orpc-meta"];
        assert_eq!(meta["userType"], "any");
        assert_eq!(meta["accessRules"][0], "widgets.read");
    }

    #[test]
    fn empty_contract_set_yields_empty_paths() {
        let spec = build_spec("Test", "1.0.0", &[]);
        assert_eq!(spec["openapi"], "3.1.0");
        assert!(spec["paths"].as_object().unwrap().is_empty());
    }
}
