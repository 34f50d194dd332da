// Order lifecycle - the hard-wired fast path table and the seed definition

//! # Order Lifecycle
//!
//! Orders are the high-traffic entity, so their state machine exists twice:
//!
//! - [`ORDER_RULES`]: compiled into code and driven by `engine::order::OrderWorkflow`
//!   with a fast-read cache in front of the durable record
//! - [`basic_order`]: the same machine as a [`WorkflowDefinition`], seeded into the
//!   definition store for the generic runtime
//!
//! ```text
//!  draft(0) --submit_order--> ordered(1) --start_cutting/start_production--> production(2)
//!     |                          |                                               |
//!     +--------cancel------------+--------cancel--> cancelled(4) <----cancel-----+
//!                                                                                |
//!                                               completed(3) <--complete---------+
//! ```
//!
//! `update_progress` loops on `production`, recording history without moving.

use serde::{Deserialize, Serialize};
use serde_json::json;

use super::action::Action;
use super::condition::{Condition, Operator};
use super::definition::{StateDefinition, TransitionDefinition, WorkflowDefinition};
use super::state::{StateId, StateType};

/// Definition code of the seeded order workflow
pub const BASIC_ORDER_CODE: &str = "basic_order";

/// Failure message of the progress guard on `complete`
pub const PROGRESS_GUARD_MESSAGE: &str = "进度不足，生产进度未达到100%";

/// Integer status stored on the order record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    Ordered,
    Production,
    Completed,
    Cancelled,
}

impl OrderStatus {
    pub const ALL: [OrderStatus; 5] = [
        OrderStatus::Draft,
        OrderStatus::Ordered,
        OrderStatus::Production,
        OrderStatus::Completed,
        OrderStatus::Cancelled,
    ];

    /// Integer code persisted in the order's `status` field
    pub fn code(&self) -> i64 {
        match self {
            OrderStatus::Draft => 0,
            OrderStatus::Ordered => 1,
            OrderStatus::Production => 2,
            OrderStatus::Completed => 3,
            OrderStatus::Cancelled => 4,
        }
    }

    pub fn from_code(code: i64) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.code() == code)
    }

    /// Workflow state id
    pub fn state_id(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "draft",
            OrderStatus::Ordered => "ordered",
            OrderStatus::Production => "production",
            OrderStatus::Completed => "completed",
            OrderStatus::Cancelled => "cancelled",
        }
    }

    pub fn from_state_id(id: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|s| s.state_id() == id)
    }

    /// Display name
    pub fn name(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "草稿",
            OrderStatus::Ordered => "已下单",
            OrderStatus::Production => "生产中",
            OrderStatus::Completed => "已完成",
            OrderStatus::Cancelled => "已取消",
        }
    }

    fn color(&self) -> &'static str {
        match self {
            OrderStatus::Draft => "#909399",
            OrderStatus::Ordered => "#409EFF",
            OrderStatus::Production => "#E6A23C",
            OrderStatus::Completed => "#67C23A",
            OrderStatus::Cancelled => "#F56C6C",
        }
    }

    /// Completed and cancelled orders are final
    pub fn is_terminal(&self) -> bool {
        matches!(self, OrderStatus::Completed | OrderStatus::Cancelled)
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.state_id())
    }
}

/// Events understood by the order fast path
pub mod events {
    pub const SUBMIT_ORDER: &str = "submit_order";
    pub const START_CUTTING: &str = "start_cutting";
    pub const START_PRODUCTION: &str = "start_production";
    pub const UPDATE_PROGRESS: &str = "update_progress";
    pub const COMPLETE: &str = "complete";
    pub const CANCEL: &str = "cancel";
}

/// One compiled order transition
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct OrderRule {
    pub from: OrderStatus,
    pub to: OrderStatus,
    pub event: &'static str,
    pub name: &'static str,
    /// Minimum production progress required, if guarded
    pub min_progress: Option<f64>,
    pub require_role: Option<&'static str>,
}

impl OrderRule {
    pub fn has_condition(&self) -> bool {
        self.min_progress.is_some()
    }

    /// The progress guard as a regular field condition
    pub fn condition(&self) -> Option<Condition> {
        self.min_progress.map(|min| {
            Condition::field("progress", Operator::Gte, json!(min), PROGRESS_GUARD_MESSAGE)
        })
    }
}

/// The order state machine, in declaration order
pub const ORDER_RULES: &[OrderRule] = &[
    OrderRule {
        from: OrderStatus::Draft,
        to: OrderStatus::Ordered,
        event: events::SUBMIT_ORDER,
        name: "提交订单",
        min_progress: None,
        require_role: None,
    },
    OrderRule {
        from: OrderStatus::Ordered,
        to: OrderStatus::Production,
        event: events::START_CUTTING,
        name: "开始裁剪",
        min_progress: None,
        require_role: None,
    },
    OrderRule {
        from: OrderStatus::Ordered,
        to: OrderStatus::Production,
        event: events::START_PRODUCTION,
        name: "开始生产",
        min_progress: None,
        require_role: None,
    },
    OrderRule {
        from: OrderStatus::Production,
        to: OrderStatus::Production,
        event: events::UPDATE_PROGRESS,
        name: "更新进度",
        min_progress: None,
        require_role: None,
    },
    OrderRule {
        from: OrderStatus::Production,
        to: OrderStatus::Completed,
        event: events::COMPLETE,
        name: "完成订单",
        min_progress: Some(1.0),
        require_role: None,
    },
    OrderRule {
        from: OrderStatus::Draft,
        to: OrderStatus::Cancelled,
        event: events::CANCEL,
        name: "取消订单",
        min_progress: None,
        require_role: Some("admin"),
    },
    OrderRule {
        from: OrderStatus::Ordered,
        to: OrderStatus::Cancelled,
        event: events::CANCEL,
        name: "取消订单",
        min_progress: None,
        require_role: Some("admin"),
    },
    OrderRule {
        from: OrderStatus::Production,
        to: OrderStatus::Cancelled,
        event: events::CANCEL,
        name: "取消订单",
        min_progress: None,
        require_role: Some("admin"),
    },
];

/// First compiled rule for `(from, event)`
pub fn find_order_rule(from: OrderStatus, event: &str) -> Option<&'static OrderRule> {
    ORDER_RULES.iter().find(|r| r.from == from && r.event == event)
}

/// The order state machine as a storable definition
///
/// Mirrors [`ORDER_RULES`] and adds a sales notification on submission.
pub fn basic_order() -> WorkflowDefinition {
    let states = OrderStatus::ALL
        .iter()
        .map(|status| {
            let state_type = match status {
                OrderStatus::Draft => StateType::Start,
                s if s.is_terminal() => StateType::End,
                _ => StateType::Normal,
            };
            StateDefinition::new(status.state_id(), status.name(), state_type)
                .with_color(status.color())
        })
        .collect();

    let transitions = ORDER_RULES
        .iter()
        .enumerate()
        .map(|(i, rule)| {
            let mut transition = TransitionDefinition::new(
                format!("t{}_{}", i + 1, rule.event),
                StateId::from(rule.from.state_id()),
                StateId::from(rule.to.state_id()),
                rule.event,
            )
            .with_name(rule.name);

            if let Some(condition) = rule.condition() {
                transition = transition.with_condition(condition);
            }
            if let Some(role) = rule.require_role {
                transition = transition.with_role(role);
            }
            if rule.event == events::SUBMIT_ORDER {
                transition = transition.with_action(Action::notify("sales", json!("订单已提交")));
            }
            transition
        })
        .collect();

    let mut definition = WorkflowDefinition::new("基础订单流程", BASIC_ORDER_CODE, states, transitions);
    definition.description = "草稿 → 已下单 → 生产中 → 已完成，可由管理员取消".to_string();
    definition
}
