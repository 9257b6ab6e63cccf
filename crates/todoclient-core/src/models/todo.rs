use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TodoItem {
    #[serde(alias = "_id")]
    pub id: String,
    pub task: String,
    #[serde(default)]
    pub completed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// `GET /todo` wraps the list in `data`; a missing list means no items.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TodoListResponse {
    #[serde(default)]
    pub data: Vec<TodoItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AddTodoResponse {
    #[serde(rename = "taskCreated")]
    pub task_created: TodoItem,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct UpdateTodoResponse {
    #[serde(default, rename = "updatedTask")]
    pub updated_task: Option<TodoItem>,
    #[serde(default)]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DeleteTodoResponse {
    #[serde(default)]
    pub message: Option<String>,
}

/// Result of `PATCH /todo/{id}`: the updated item when the server echoes
/// it back, otherwise its status message.
#[derive(Debug, Clone, PartialEq)]
pub enum TodoUpdate {
    Updated(TodoItem),
    Message(String),
}

pub const DEFAULT_UPDATE_MESSAGE: &str = "Task updated successfully";
pub const DEFAULT_DELETE_MESSAGE: &str = "Task deleted successfully";

impl From<UpdateTodoResponse> for TodoUpdate {
    fn from(response: UpdateTodoResponse) -> Self {
        match (response.updated_task, response.message) {
            (Some(item), _) => TodoUpdate::Updated(item),
            (None, Some(message)) => TodoUpdate::Message(message),
            (None, None) => TodoUpdate::Message(DEFAULT_UPDATE_MESSAGE.to_string()),
        }
    }
}

impl DeleteTodoResponse {
    pub fn message_or_default(self) -> String {
        self.message
            .unwrap_or_else(|| DEFAULT_DELETE_MESSAGE.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_list_defaults_to_empty() {
        let parsed: TodoListResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.data.is_empty());
    }

    #[test]
    fn test_parse_item_from_server() {
        let json = r#"{"data":[{"_id":"1","task":"buy milk","completed":true,"createdAt":"2024-05-01T10:00:00Z"}]}"#;
        let parsed: TodoListResponse = serde_json::from_str(json).unwrap();
        assert_eq!(parsed.data.len(), 1);
        assert_eq!(parsed.data[0].id, "1");
        assert!(parsed.data[0].completed);
        assert!(parsed.data[0].created_at.is_some());
    }

    #[test]
    fn test_update_falls_back_to_message() {
        let echoed: UpdateTodoResponse =
            serde_json::from_str(r#"{"updatedTask":{"_id":"1","task":"x"}}"#).unwrap();
        assert!(matches!(TodoUpdate::from(echoed), TodoUpdate::Updated(item) if item.task == "x"));

        let message: UpdateTodoResponse = serde_json::from_str(r#"{"message":"ok"}"#).unwrap();
        assert_eq!(TodoUpdate::from(message), TodoUpdate::Message("ok".to_string()));

        let empty: UpdateTodoResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(
            TodoUpdate::from(empty),
            TodoUpdate::Message(DEFAULT_UPDATE_MESSAGE.to_string())
        );
    }

    #[test]
    fn test_delete_message_default() {
        let empty: DeleteTodoResponse = serde_json::from_str("{}").unwrap();
        assert_eq!(empty.message_or_default(), DEFAULT_DELETE_MESSAGE);
    }
}
