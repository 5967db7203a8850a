//! HTTP API for the Overseer engine.
//!
//! ## Endpoints
//!
//! - `POST /api/task` - Submit a new task (optional budget)
//! - `GET /api/task/{id}` - Get task status and result
//! - `POST /api/task/{id}/approve` - Approve a checkpoint and resume
//! - `POST /api/task/{id}/reject` - Reject a checkpoint (terminal)
//! - `GET /api/tasks` - List active tasks
//! - `GET /api/status` - Queue counts and daily/monthly spend
//! - `GET /api/cost` - Cost breakdown including active root budgets
//! - `GET /api/health` - Health check

mod routes;

pub use routes::serve;
