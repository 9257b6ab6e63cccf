//! Data models for the to-do service.
//!
//! - `User`: the profile of the logged-in account
//! - `TodoItem`: a single task owned by that account
//! - request/response bodies for the `/user` and `/todo` endpoints

pub mod todo;
pub mod user;

pub use todo::{AddTodoResponse, DeleteTodoResponse, TodoItem, TodoListResponse, TodoUpdate, UpdateTodoResponse};
pub use user::{LoginCredentials, LoginResponse, MeResponse, RegisterRequest, RegisterResponse, User};
