pub mod batch_executor;
pub mod maintenance;
pub mod market_calendar;
pub mod monitoring_service;
pub mod notification;
pub mod order_service;
pub mod planner;
pub mod registry;
pub mod replanner;
pub mod trigger_client;

pub use batch_executor::{BatchExecutor, CheckOutcome, ExecutorDeps};
pub use maintenance::{ExpirySweepReport, MaintenanceService};
pub use market_calendar::{ExchangeCalendar, MarketCalendar};
pub use monitoring_service::{ClientState, MonitoringService, MonitoringStatus, StartOptions};
pub use notification::{Notification, NotificationDispatcher, TelegramNotifier};
pub use order_service::{HttpOrderExecutor, OrderExecutor};
pub use planner::{Batch, BatchPerformanceMetrics, BatchPlanner, PlannerConfig};
pub use registry::{CanStart, StockInfo, SubscribeRequest, SubscriptionRegistry};
pub use replanner::Replanner;
pub use trigger_client::{Evaluation, EvaluationContext, HardStop, HardStopKind, HttpTriggerEvaluator, TriggerEvaluator};
