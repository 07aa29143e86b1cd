use std::time::Duration;

use async_trait::async_trait;
use percent_encoding::{utf8_percent_encode, NON_ALPHANUMERIC};
use reqwest::{header, Client, Response, StatusCode};
use serde_json::Value;
use url::Url;

use super::{IdpClient, IdpGroup, IdpUser};
use crate::{
    db::models::{GroupId, UserId},
    error::{ApiResult, MapResult},
    util::get_reqwest_client_builder,
    CONFIG,
};

/// Okta-flavored implementation of the identity provider contract.
/// Conflicts on add and misses on remove count as success so the queued
/// writes stay idempotent.
pub struct OktaClient {
    base_url: Url,
    client: Client,
}

impl OktaClient {
    pub fn new(base_url: String, api_token: String) -> Self {
        let base_url = Url::parse(&base_url).expect("IDP_BASE_URL validated at startup");

        let mut headers = header::HeaderMap::new();
        let mut auth = header::HeaderValue::from_str(&format!("SSWS {api_token}"))
            .expect("IDP_API_TOKEN is not a valid header value");
        auth.set_sensitive(true);
        headers.insert(header::AUTHORIZATION, auth);
        headers.insert(header::ACCEPT, header::HeaderValue::from_static("application/json"));

        let client = get_reqwest_client_builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(CONFIG.idp_timeout()))
            .build()
            .expect("Failed to build identity provider client");

        Self {
            base_url,
            client,
        }
    }

    fn api_url(&self, path: &str) -> String {
        format!("{}api/v1/{path}", self.base_url)
    }

    /// Follows `Link: <...>; rel="next"` cursors until the collection is
    /// exhausted.
    async fn get_paginated(&self, path: &str) -> ApiResult<Vec<Value>> {
        let mut items = Vec::new();
        let mut next = Some(self.api_url(path));

        while let Some(url) = next.take() {
            let res = self.client.get(&url).send().await.map_res("Error listing from the identity provider")?;
            next = next_link(&res);

            let page: Vec<Value> =
                res.error_for_status().map_res("Identity provider list failed")?.json().await.map_res("Error parsing identity provider response")?;
            items.extend(page);
        }

        Ok(items)
    }

    /// Idempotency shim: conflicts and misses report success
    async fn accept_idempotent(res: Response, what: &str) -> ApiResult<()> {
        match res.status() {
            StatusCode::NOT_FOUND | StatusCode::CONFLICT => Ok(()),
            _ => {
                res.error_for_status().map_res(what)?;
                Ok(())
            }
        }
    }
}

fn next_link(res: &Response) -> Option<String> {
    for value in res.headers().get_all(header::LINK) {
        let value = value.to_str().ok()?;
        for part in value.split(',') {
            if part.contains("rel=\"next\"") {
                let url = part.split(';').next()?.trim();
                return Some(url.trim_start_matches('<').trim_end_matches('>').to_string());
            }
        }
    }
    None
}

fn user_from_json(value: &Value) -> IdpUser {
    let profile = value.get("profile").cloned().unwrap_or_default();
    let text = |key: &str| profile.get(key).and_then(Value::as_str).unwrap_or_default().to_string();

    IdpUser {
        id: UserId::from(value.get("id").and_then(Value::as_str).unwrap_or_default().to_string()),
        email: text("email").to_lowercase(),
        first_name: text("firstName"),
        last_name: text("lastName"),
        display_name: text("displayName"),
        employee_number: profile.get("employeeNumber").and_then(Value::as_str).map(String::from),
        manager_id: profile.get("managerId").and_then(Value::as_str).map(|id| UserId::from(id.to_string())),
        active: matches!(value.get("status").and_then(Value::as_str), Some("ACTIVE" | "PROVISIONED" | "STAGED")),
        profile,
    }
}

fn group_from_json(value: &Value) -> IdpGroup {
    let profile = value.get("profile").cloned().unwrap_or_default();
    IdpGroup {
        id: GroupId::from(value.get("id").and_then(Value::as_str).unwrap_or_default().to_string()),
        name: profile.get("name").and_then(Value::as_str).unwrap_or_default().to_string(),
        description: profile.get("description").and_then(Value::as_str).unwrap_or_default().to_string(),
    }
}

#[async_trait]
impl IdpClient for OktaClient {
    async fn list_users(&self) -> ApiResult<Vec<IdpUser>> {
        let items = self.get_paginated("users?limit=200").await?;
        Ok(items.iter().map(user_from_json).collect())
    }

    async fn get_user_schema(&self, user_type: &str) -> ApiResult<Value> {
        let encoded = utf8_percent_encode(user_type, NON_ALPHANUMERIC).to_string();
        let res = self
            .client
            .get(self.api_url(&format!("meta/schemas/user/{encoded}")))
            .send()
            .await
            .map_res("Error fetching the user schema")?;
        res.error_for_status().map_res("User schema fetch failed")?.json().await.map_res("Error parsing the user schema")
    }

    async fn list_groups(&self) -> ApiResult<Vec<IdpGroup>> {
        let items = self.get_paginated("groups?limit=200").await?;
        Ok(items.iter().map(group_from_json).collect())
    }

    async fn list_users_for_group(&self, group_id: &GroupId) -> ApiResult<Vec<UserId>> {
        let items = self.get_paginated(&format!("groups/{group_id}/users?limit=200")).await?;
        Ok(items.iter().map(|u| UserId::from(u.get("id").and_then(Value::as_str).unwrap_or_default().to_string())).collect())
    }

    async fn list_owners_for_group(&self, group_id: &GroupId) -> ApiResult<Vec<UserId>> {
        let items = self.get_paginated(&format!("groups/{group_id}/owners?limit=200")).await?;
        Ok(items.iter().map(|u| UserId::from(u.get("id").and_then(Value::as_str).unwrap_or_default().to_string())).collect())
    }

    async fn list_groups_with_active_rules(&self) -> ApiResult<Vec<GroupId>> {
        let rules = self.get_paginated("groups/rules?limit=200&status=ACTIVE").await?;

        let mut group_ids = Vec::new();
        for rule in &rules {
            if let Some(ids) = rule
                .pointer("/actions/assignUserToGroups/groupIds")
                .and_then(Value::as_array)
            {
                group_ids.extend(
                    ids.iter().filter_map(Value::as_str).map(|id| GroupId::from(id.to_string())),
                );
            }
        }
        group_ids.sort();
        group_ids.dedup();
        Ok(group_ids)
    }

    async fn create_group(&self, name: &str, description: &str) -> ApiResult<Option<IdpGroup>> {
        let res = self
            .client
            .post(self.api_url("groups"))
            .json(&json!({ "profile": { "name": name, "description": description } }))
            .send()
            .await
            .map_res("Error creating the group")?;

        // An existing group with this name comes back as a conflict; the
        // caller adopts it by name lookup instead.
        if res.status() == StatusCode::CONFLICT {
            return Ok(None);
        }

        let body: Value = res.error_for_status().map_res("Group create failed")?.json().await.map_res("Error parsing the created group")?;
        Ok(Some(group_from_json(&body)))
    }

    async fn find_group_by_name(&self, name: &str) -> ApiResult<Option<IdpGroup>> {
        let encoded = utf8_percent_encode(name, NON_ALPHANUMERIC).to_string();
        let items = self.get_paginated(&format!("groups?q={encoded}&limit=200")).await?;
        Ok(items
            .iter()
            .map(group_from_json)
            .find(|g| g.name.eq_ignore_ascii_case(name)))
    }

    async fn update_group(&self, group_id: &GroupId, name: &str, description: &str) -> ApiResult<()> {
        let res = self
            .client
            .put(self.api_url(&format!("groups/{group_id}")))
            .json(&json!({ "profile": { "name": name, "description": description } }))
            .send()
            .await
            .map_res("Error updating the group")?;
        res.error_for_status().map_res("Group update failed")?;
        Ok(())
    }

    async fn delete_group(&self, group_id: &GroupId) -> ApiResult<()> {
        let res = self
            .client
            .delete(self.api_url(&format!("groups/{group_id}")))
            .send()
            .await
            .map_res("Error deleting the group")?;
        Self::accept_idempotent(res, "Group delete failed").await
    }

    async fn add_user_to_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        let res = self
            .client
            .put(self.api_url(&format!("groups/{group_id}/users/{user_id}")))
            .send()
            .await
            .map_res("Error adding the group member")?;
        Self::accept_idempotent(res, "Member add failed").await
    }

    async fn remove_user_from_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        let res = self
            .client
            .delete(self.api_url(&format!("groups/{group_id}/users/{user_id}")))
            .send()
            .await
            .map_res("Error removing the group member")?;
        Self::accept_idempotent(res, "Member remove failed").await
    }

    async fn add_owner_to_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        let res = self
            .client
            .post(self.api_url(&format!("groups/{group_id}/owners")))
            .json(&json!({ "id": user_id, "type": "USER" }))
            .send()
            .await
            .map_res("Error adding the group owner")?;
        Self::accept_idempotent(res, "Owner add failed").await
    }

    async fn remove_owner_from_group(&self, group_id: &GroupId, user_id: &UserId) -> ApiResult<()> {
        let res = self
            .client
            .delete(self.api_url(&format!("groups/{group_id}/owners/{user_id}")))
            .send()
            .await
            .map_res("Error removing the group owner")?;
        Self::accept_idempotent(res, "Owner remove failed").await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn link_header_parsing_handles_multiple_rels() {
        // next_link works on reqwest Responses; the split logic is what
        // matters, so probe it through a hand-built header line.
        let line = r#"<https://example.okta.com/api/v1/users?after=abc&limit=200>; rel="next", <https://example.okta.com/api/v1/users?limit=200>; rel="self""#;
        let url = line
            .split(',')
            .find(|part| part.contains("rel=\"next\""))
            .and_then(|part| part.split(';').next())
            .map(|url| url.trim().trim_start_matches('<').trim_end_matches('>').to_string());
        assert_eq!(url.as_deref(), Some("https://example.okta.com/api/v1/users?after=abc&limit=200"));
    }
}
