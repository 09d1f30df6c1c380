//! Route handlers.
//!
//! [`ListService`] implements one operation per route. [`ListService::dispatch`]
//! is the single entry point used by both the API Gateway proxy adapter and
//! the local router, so both see identical behavior.

use crate::errors::ApiError;
use crate::lists::{
    key, list_sk, now, task_prefix, task_sk, user_pk, validate_id, validate_title,
    CreateListRequest, NewTask, Record, RecordUpdate, Status, StatusRequest, TaskList,
    UpdateListRequest, ALL_LISTS_PREFIX,
};
use crate::store::ItemStore;
use infra::table::ItemKey;
use infra::api::{HttpMethod, Route};
use serde::de::DeserializeOwned;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Authenticated caller, identified by the directory's `sub` claim.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Caller {
    pub sub: String,
    pub email: Option<String>,
}

impl Caller {
    /// Rejects empty subjects.
    pub fn new(sub: impl Into<String>, email: Option<String>) -> Result<Self, ApiError> {
        let sub = sub.into();
        if sub.trim().is_empty() {
            return Err(ApiError::Unauthorized("Token has no subject".to_string()));
        }
        Ok(Self { sub, email })
    }
}

/// A handler result: status code and optional JSON body.
#[derive(Debug, Clone, PartialEq)]
pub struct Reply {
    pub status: u16,
    pub body: Option<Value>,
}

impl Reply {
    fn json(status: u16, body: impl serde::Serialize) -> Result<Self, ApiError> {
        let body = serde_json::to_value(body).map_err(|e| ApiError::Internal(e.to_string()))?;
        Ok(Self {
            status,
            body: Some(body),
        })
    }

    fn no_content() -> Self {
        Self {
            status: 204,
            body: None,
        }
    }
}

/// Task list operations over an [`ItemStore`].
#[derive(Clone)]
pub struct ListService {
    store: Arc<dyn ItemStore>,
}

impl ListService {
    pub fn new(store: Arc<dyn ItemStore>) -> Self {
        Self { store }
    }

    /// Runs the operation bound to `route`.
    pub async fn dispatch(
        &self,
        route: &Route,
        params: &BTreeMap<String, String>,
        caller: &Caller,
        body: Option<&str>,
    ) -> Result<Reply, ApiError> {
        let param = |name: &str| {
            params
                .get(name)
                .filter(|v| !v.is_empty())
                .map(String::as_str)
                .ok_or_else(|| ApiError::BadRequest(format!("Missing path parameter {name}")))
        };

        info!(route = %route, user = %caller.sub, "Handling request");
        match (route.method, route.path) {
            (HttpMethod::Post, "/items") => {
                let list = self.create_list(caller, parse_body(body)?).await?;
                Reply::json(201, list)
            }
            (HttpMethod::Get, "/items") => Reply::json(200, self.list_lists(caller).await?),
            (HttpMethod::Get, "/items/{listID}") => {
                Reply::json(200, self.get_list(caller, param("listID")?).await?)
            }
            (HttpMethod::Patch, "/items/{listID}") => {
                let list = self
                    .update_list(caller, param("listID")?, parse_body(body)?)
                    .await?;
                Reply::json(200, list)
            }
            (HttpMethod::Patch, "/items/{listID}/status") => {
                let request: StatusRequest = parse_body(body)?;
                let list = self
                    .set_list_status(caller, param("listID")?, request.status.parse()?)
                    .await?;
                Reply::json(200, list)
            }
            (HttpMethod::Patch, "/items/{listID}/{taskID}/status") => {
                let request: StatusRequest = parse_body(body)?;
                let list = self
                    .set_task_status(
                        caller,
                        param("listID")?,
                        param("taskID")?,
                        request.status.parse()?,
                    )
                    .await?;
                Reply::json(200, list)
            }
            (HttpMethod::Delete, "/items/{listID}") => {
                self.delete_list(caller, param("listID")?).await?;
                Ok(Reply::no_content())
            }
            (HttpMethod::Delete, "/items/{listID}/{taskID}") => {
                self.delete_task(caller, param("listID")?, param("taskID")?).await?;
                Ok(Reply::no_content())
            }
            _ => Err(ApiError::NotFound(format!("No handler for {route}"))),
        }
    }

    /// Creates a list with optional initial tasks.
    pub async fn create_list(
        &self,
        caller: &Caller,
        request: CreateListRequest,
    ) -> Result<TaskList, ApiError> {
        let title = validate_title(&request.title)?;
        let titles = task_titles(&request.tasks)?;
        let now = now()?;
        let list_id = Uuid::new_v4().to_string();

        let list = Record::new_list(&caller.sub, &list_id, &title, &now)?;
        self.store.put(&list).await?;
        let tasks = self.add_tasks(caller, &list_id, &titles, &now).await?;

        info!(list_id = %list_id, tasks = tasks.len(), "Created list");
        Ok(TaskList::from_records(list, tasks))
    }

    /// All lists of the caller with their tasks.
    pub async fn list_lists(&self, caller: &Caller) -> Result<Vec<TaskList>, ApiError> {
        let records = self
            .store
            .query_prefix(&user_pk(&caller.sub), ALL_LISTS_PREFIX)
            .await?;
        Ok(TaskList::group(records))
    }

    /// One list with its tasks.
    pub async fn get_list(&self, caller: &Caller, list_id: &str) -> Result<TaskList, ApiError> {
        let list = self.list_record(caller, list_id).await?;
        let tasks = self
            .store
            .query_prefix(&user_pk(&caller.sub), &task_prefix(list_id))
            .await?;
        Ok(TaskList::from_records(list, tasks))
    }

    /// Renames a list and/or appends tasks.
    pub async fn update_list(
        &self,
        caller: &Caller,
        list_id: &str,
        request: UpdateListRequest,
    ) -> Result<TaskList, ApiError> {
        if request.title.is_none() && request.tasks.is_none() {
            return Err(ApiError::BadRequest(
                "Nothing to update, expected title or tasks".to_string(),
            ));
        }
        let title = request.title.as_deref().map(validate_title).transpose()?;
        let titles = task_titles(request.tasks.as_deref().unwrap_or_default())?;
        let now = now()?;

        let update = RecordUpdate {
            title,
            status: None,
            updated_at: now.clone(),
        };
        let list_key = list_record_key(caller, list_id)?;
        if self.store.update(&list_key, &update).await?.is_none() {
            return Err(not_found_list(list_id));
        }
        self.add_tasks(caller, list_id, &titles, &now).await?;

        self.get_list(caller, list_id).await
    }

    /// Marks a list open or done.
    pub async fn set_list_status(
        &self,
        caller: &Caller,
        list_id: &str,
        status: Status,
    ) -> Result<TaskList, ApiError> {
        let update = RecordUpdate {
            title: None,
            status: Some(status),
            updated_at: now()?,
        };
        let list_key = list_record_key(caller, list_id)?;
        if self.store.update(&list_key, &update).await?.is_none() {
            return Err(not_found_list(list_id));
        }
        self.get_list(caller, list_id).await
    }

    /// Marks one task open or done.
    pub async fn set_task_status(
        &self,
        caller: &Caller,
        list_id: &str,
        task_id: &str,
        status: Status,
    ) -> Result<TaskList, ApiError> {
        self.list_record(caller, list_id).await?;

        let update = RecordUpdate {
            title: None,
            status: Some(status),
            updated_at: now()?,
        };
        let task_key = task_record_key(caller, list_id, task_id)?;
        if self.store.update(&task_key, &update).await?.is_none() {
            return Err(not_found_task(list_id, task_id));
        }
        self.get_list(caller, list_id).await
    }

    /// Deletes a list and all its tasks.
    pub async fn delete_list(&self, caller: &Caller, list_id: &str) -> Result<(), ApiError> {
        let list = self.list_record(caller, list_id).await?;
        let tasks = self
            .store
            .query_prefix(&user_pk(&caller.sub), &task_prefix(list_id))
            .await?;

        let keys: Vec<_> = tasks
            .into_iter()
            .map(|r| r.key)
            .chain(std::iter::once(list.key))
            .collect();
        self.store.batch_delete(&keys).await?;

        info!(list_id = %list_id, records = keys.len(), "Deleted list");
        Ok(())
    }

    /// Deletes one task.
    pub async fn delete_task(
        &self,
        caller: &Caller,
        list_id: &str,
        task_id: &str,
    ) -> Result<(), ApiError> {
        let task_key = task_record_key(caller, list_id, task_id)?;
        if !self.store.delete(&task_key).await? {
            return Err(not_found_task(list_id, task_id));
        }
        Ok(())
    }

    async fn list_record(&self, caller: &Caller, list_id: &str) -> Result<Record, ApiError> {
        let list_key = list_record_key(caller, list_id)?;
        self.store
            .get(&list_key)
            .await?
            .ok_or_else(|| not_found_list(list_id))
    }

    async fn add_tasks(
        &self,
        caller: &Caller,
        list_id: &str,
        titles: &[String],
        now: &str,
    ) -> Result<Vec<Record>, ApiError> {
        let mut tasks = Vec::with_capacity(titles.len());
        for title in titles {
            let task_id = Uuid::new_v4().to_string();
            let task = Record::new_task(&caller.sub, list_id, &task_id, title, now)?;
            self.store.put(&task).await?;
            tasks.push(task);
        }
        Ok(tasks)
    }
}

fn list_record_key(caller: &Caller, list_id: &str) -> Result<ItemKey, ApiError> {
    let list_id = validate_id("List", list_id)?;
    key(user_pk(&caller.sub), list_sk(list_id))
}

fn task_record_key(caller: &Caller, list_id: &str, task_id: &str) -> Result<ItemKey, ApiError> {
    let list_id = validate_id("List", list_id)?;
    let task_id = validate_id("Task", task_id)?;
    key(user_pk(&caller.sub), task_sk(list_id, task_id))
}

fn task_titles(tasks: &[NewTask]) -> Result<Vec<String>, ApiError> {
    tasks.iter().map(|t| validate_title(&t.title)).collect()
}

fn not_found_list(list_id: &str) -> ApiError {
    ApiError::NotFound(format!("List {list_id} not found"))
}

fn not_found_task(list_id: &str, task_id: &str) -> ApiError {
    ApiError::NotFound(format!("Task {task_id} not found in list {list_id}"))
}

fn parse_body<T: DeserializeOwned>(body: Option<&str>) -> Result<T, ApiError> {
    let body = body
        .filter(|b| !b.trim().is_empty())
        .ok_or_else(|| ApiError::BadRequest("Request body is required".to_string()))?;
    Ok(serde_json::from_str(body)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;
    use infra::api::RouteTable;
    use serde_json::json;
    use tracing_test::traced_test;

    fn service() -> (ListService, MemoryStore) {
        let store = MemoryStore::new();
        (ListService::new(Arc::new(store.clone())), store)
    }

    fn caller(sub: &str) -> Caller {
        Caller::new(sub, None).unwrap()
    }

    async fn call(
        service: &ListService,
        caller: &Caller,
        method: HttpMethod,
        path: &str,
        body: Option<Value>,
    ) -> Result<Reply, ApiError> {
        let (route, params) = RouteTable::default().find(method, path).unwrap();
        let body = body.map(|b| b.to_string());
        service.dispatch(&route, &params, caller, body.as_deref()).await
    }

    #[test]
    fn test_caller_requires_subject() {
        assert!(matches!(Caller::new(" ", None), Err(ApiError::Unauthorized(_))));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_create_and_read_list() {
        let (service, store) = service();
        let alice = caller("alice");

        let created = call(
            &service,
            &alice,
            HttpMethod::Post,
            "/items",
            Some(json!({
                "title": "Groceries",
                "tasks": [{ "title": "Milk" }, { "title": "Eggs" }]
            })),
        )
        .await
        .unwrap();
        assert_eq!(created.status, 201);
        let body = created.body.unwrap();
        let list_id = body["listID"].as_str().unwrap().to_string();
        assert_eq!(body["tasks"].as_array().unwrap().len(), 2);
        assert_eq!(store.len().await, 3);

        let fetched = call(&service, &alice, HttpMethod::Get, &format!("/items/{list_id}"), None)
            .await
            .unwrap();
        assert_eq!(fetched.body.unwrap()["title"], "Groceries");

        let all = call(&service, &alice, HttpMethod::Get, "/items", None).await.unwrap();
        assert_eq!(all.body.unwrap().as_array().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_lists_are_isolated_per_user() {
        let (service, _) = service();
        let list = service
            .create_list(
                &caller("alice"),
                CreateListRequest { title: "Mine".to_string(), tasks: Vec::new() },
            )
            .await
            .unwrap();

        let err = service.get_list(&caller("bob"), &list.list_id).await.unwrap_err();
        assert!(matches!(err, ApiError::NotFound(_)));
        assert!(service.list_lists(&caller("bob")).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_update_list_renames_and_appends() {
        let (service, _) = service();
        let alice = caller("alice");
        let list = service
            .create_list(&alice, CreateListRequest { title: "Trip".to_string(), tasks: Vec::new() })
            .await
            .unwrap();

        let reply = call(
            &service,
            &alice,
            HttpMethod::Patch,
            &format!("/items/{}", list.list_id),
            Some(json!({ "title": "Road trip", "tasks": [{ "title": "Fuel" }] })),
        )
        .await
        .unwrap();
        let body = reply.body.unwrap();
        assert_eq!(body["title"], "Road trip");
        assert_eq!(body["tasks"][0]["title"], "Fuel");

        let empty = call(
            &service,
            &alice,
            HttpMethod::Patch,
            &format!("/items/{}", list.list_id),
            Some(json!({})),
        )
        .await;
        assert!(matches!(empty, Err(ApiError::BadRequest(_))));
    }

    #[tokio::test]
    async fn test_status_routes() {
        let (service, _) = service();
        let alice = caller("alice");
        let list = service
            .create_list(
                &alice,
                CreateListRequest {
                    title: "Chores".to_string(),
                    tasks: vec![NewTask { title: "Dishes".to_string() }],
                },
            )
            .await
            .unwrap();
        let task_id = &list.tasks[0].task_id;

        let reply = call(
            &service,
            &alice,
            HttpMethod::Patch,
            &format!("/items/{}/{}/status", list.list_id, task_id),
            Some(json!({ "status": "done" })),
        )
        .await
        .unwrap();
        assert_eq!(reply.body.unwrap()["tasks"][0]["status"], "done");

        let reply = call(
            &service,
            &alice,
            HttpMethod::Patch,
            &format!("/items/{}/status", list.list_id),
            Some(json!({ "status": "done" })),
        )
        .await
        .unwrap();
        assert_eq!(reply.body.unwrap()["status"], "done");

        let invalid = call(
            &service,
            &alice,
            HttpMethod::Patch,
            &format!("/items/{}/status", list.list_id),
            Some(json!({ "status": "archived" })),
        )
        .await;
        assert!(matches!(invalid, Err(ApiError::BadRequest(_))));

        let missing = call(
            &service,
            &alice,
            HttpMethod::Patch,
            &format!("/items/{}/nope/status", list.list_id),
            Some(json!({ "status": "done" })),
        )
        .await;
        assert!(matches!(missing, Err(ApiError::NotFound(_))));
    }

    fn is_not_found<T>(result: Result<T, ApiError>) -> bool {
        matches!(result, Err(ApiError::NotFound(_)))
    }

    #[tokio::test]
    async fn test_ids_with_key_separator_are_rejected() {
        let (service, store) = service();
        let alice = caller("alice");
        let list = service
            .create_list(
                &alice,
                CreateListRequest {
                    title: "Chores".to_string(),
                    tasks: vec![NewTask { title: "Dishes".to_string() }],
                },
            )
            .await
            .unwrap();
        let task_id = list.tasks[0].task_id.clone();
        let forged = format!("{}#TASK#{}", list.list_id, task_id);

        assert!(is_not_found(service.get_list(&alice, &forged).await));
        assert!(is_not_found(
            service
                .update_list(
                    &alice,
                    &forged,
                    UpdateListRequest {
                        title: None,
                        tasks: Some(vec![NewTask { title: "Orphan".to_string() }]),
                    },
                )
                .await
        ));
        assert!(is_not_found(service.set_list_status(&alice, &forged, Status::Done).await));
        assert!(is_not_found(
            service.set_task_status(&alice, &list.list_id, "x#y", Status::Done).await
        ));
        assert!(is_not_found(service.delete_task(&alice, &forged, &task_id).await));
        assert!(is_not_found(service.delete_list(&alice, &forged).await));

        assert_eq!(store.len().await, 2);
        let fetched = service.get_list(&alice, &list.list_id).await.unwrap();
        assert_eq!(fetched.tasks.len(), 1);
        assert_eq!(fetched.tasks[0].status, Status::Open);
    }

    #[tokio::test]
    async fn test_delete_routes() {
        let (service, store) = service();
        let alice = caller("alice");
        let list = service
            .create_list(
                &alice,
                CreateListRequest {
                    title: "Chores".to_string(),
                    tasks: vec![
                        NewTask { title: "Dishes".to_string() },
                        NewTask { title: "Laundry".to_string() },
                    ],
                },
            )
            .await
            .unwrap();

        let path = format!("/items/{}/{}", list.list_id, list.tasks[0].task_id);
        let reply = call(&service, &alice, HttpMethod::Delete, &path, None).await.unwrap();
        assert_eq!(reply, Reply { status: 204, body: None });
        assert_eq!(store.len().await, 2);
        assert!(matches!(
            call(&service, &alice, HttpMethod::Delete, &path, None).await,
            Err(ApiError::NotFound(_))
        ));

        let path = format!("/items/{}", list.list_id);
        call(&service, &alice, HttpMethod::Delete, &path, None).await.unwrap();
        assert!(store.is_empty().await);
        assert!(matches!(
            call(&service, &alice, HttpMethod::Delete, &path, None).await,
            Err(ApiError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_body_validation() {
        let (service, store) = service();
        let alice = caller("alice");

        let missing = call(&service, &alice, HttpMethod::Post, "/items", None).await;
        assert!(matches!(missing, Err(ApiError::BadRequest(_))));

        let blank_title = Some(json!({ "title": "  " }));
        let blank = call(&service, &alice, HttpMethod::Post, "/items", blank_title).await;
        assert!(matches!(blank, Err(ApiError::BadRequest(_))));

        let bad_task = call(
            &service,
            &alice,
            HttpMethod::Post,
            "/items",
            Some(json!({ "title": "ok", "tasks": [{ "title": "" }] })),
        )
        .await;
        assert!(matches!(bad_task, Err(ApiError::BadRequest(_))));
        assert!(store.is_empty().await);
    }
}
