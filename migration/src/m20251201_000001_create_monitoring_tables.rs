use sea_orm_migration::prelude::*;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .create_table(
                Table::create()
                    .table(MonitoringSubscriptions::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(MonitoringSubscriptions::Id).big_integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(MonitoringSubscriptions::AnalysisId).string_len(64).not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::StrategyId).string_len(64).not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::StockSymbol).string_len(32).not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::InstrumentKey).string_len(64).not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::Subscribers).json().not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::Status).string_len(32).not_null().default("active"))
                    .col(ColumnDef::new(MonitoringSubscriptions::LastTriggerSnapshot).json().null())
                    .col(ColumnDef::new(MonitoringSubscriptions::ConditionsMetAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(MonitoringSubscriptions::NotificationSentAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(MonitoringSubscriptions::StoppedAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(MonitoringSubscriptions::StopReason).string_len(32).null())
                    .col(ColumnDef::new(MonitoringSubscriptions::ExpiresAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::Config).json().not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::JobRef).string_len(64).null())
                    .col(ColumnDef::new(MonitoringSubscriptions::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MonitoringSubscriptions::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        // one live record per setup
        manager
            .create_index(
                Index::create()
                    .name("uq_monitoring_subscriptions_setup")
                    .table(MonitoringSubscriptions::Table)
                    .col(MonitoringSubscriptions::AnalysisId)
                    .col(MonitoringSubscriptions::StrategyId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_monitoring_subscriptions_status_expires")
                    .table(MonitoringSubscriptions::Table)
                    .col(MonitoringSubscriptions::Status)
                    .col(MonitoringSubscriptions::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MonitoringJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(MonitoringJobs::Id).big_integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(MonitoringJobs::Name).string_len(64).not_null())
                    .col(ColumnDef::new(MonitoringJobs::JobKey).string_len(128).not_null())
                    .col(ColumnDef::new(MonitoringJobs::Payload).json().not_null())
                    .col(ColumnDef::new(MonitoringJobs::Schedule).json().not_null())
                    .col(ColumnDef::new(MonitoringJobs::NextRunAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MonitoringJobs::LockedAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(MonitoringJobs::LockedBy).string_len(64).null())
                    .col(ColumnDef::new(MonitoringJobs::LastRunAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(MonitoringJobs::LastFinishedAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(MonitoringJobs::FailCount).integer().not_null().default(0))
                    .col(ColumnDef::new(MonitoringJobs::LastError).text().null())
                    .col(ColumnDef::new(MonitoringJobs::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(MonitoringJobs::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("uq_monitoring_jobs_name_key")
                    .table(MonitoringJobs::Table)
                    .col(MonitoringJobs::Name)
                    .col(MonitoringJobs::JobKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_monitoring_jobs_next_run")
                    .table(MonitoringJobs::Table)
                    .col(MonitoringJobs::NextRunAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(MonitoringAuditLogs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(MonitoringAuditLogs::Id).big_integer().not_null().auto_increment().primary_key())
                    .col(ColumnDef::new(MonitoringAuditLogs::AnalysisId).string_len(64).not_null())
                    .col(ColumnDef::new(MonitoringAuditLogs::StrategyId).string_len(64).not_null())
                    .col(ColumnDef::new(MonitoringAuditLogs::UserId).big_integer().not_null())
                    .col(ColumnDef::new(MonitoringAuditLogs::Status).string_len(32).not_null())
                    .col(ColumnDef::new(MonitoringAuditLogs::Reason).text().null())
                    .col(ColumnDef::new(MonitoringAuditLogs::Details).json().null())
                    .col(ColumnDef::new(MonitoringAuditLogs::DurationMs).big_integer().null())
                    .col(ColumnDef::new(MonitoringAuditLogs::CreatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_monitoring_audit_logs_setup")
                    .table(MonitoringAuditLogs::Table)
                    .col(MonitoringAuditLogs::AnalysisId)
                    .col(MonitoringAuditLogs::StrategyId)
                    .col(MonitoringAuditLogs::CreatedAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_table(
                Table::create()
                    .table(StockAnalyses::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(StockAnalyses::Id).string_len(64).not_null().primary_key())
                    .col(ColumnDef::new(StockAnalyses::UserId).big_integer().not_null())
                    .col(ColumnDef::new(StockAnalyses::StockSymbol).string_len(32).not_null())
                    .col(ColumnDef::new(StockAnalyses::InstrumentKey).string_len(64).not_null())
                    .col(ColumnDef::new(StockAnalyses::Strategies).json().not_null())
                    .col(ColumnDef::new(StockAnalyses::ValidUntil).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(StockAnalyses::OrdersPlaced).boolean().not_null().default(false))
                    .col(ColumnDef::new(StockAnalyses::OrderPlacementInProgress).boolean().not_null().default(false))
                    .col(ColumnDef::new(StockAnalyses::OrderPlacementStartedAt).timestamp_with_time_zone().null())
                    .col(ColumnDef::new(StockAnalyses::CreatedAt).timestamp_with_time_zone().not_null())
                    .col(ColumnDef::new(StockAnalyses::UpdatedAt).timestamp_with_time_zone().not_null())
                    .to_owned(),
            )
            .await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(StockAnalyses::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MonitoringAuditLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MonitoringJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(MonitoringSubscriptions::Table).to_owned())
            .await
    }
}

#[derive(DeriveIden)]
enum MonitoringSubscriptions {
    Table,
    Id,
    AnalysisId,
    StrategyId,
    StockSymbol,
    InstrumentKey,
    Subscribers,
    Status,
    LastTriggerSnapshot,
    ConditionsMetAt,
    NotificationSentAt,
    StoppedAt,
    StopReason,
    ExpiresAt,
    Config,
    JobRef,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum MonitoringJobs {
    Table,
    Id,
    Name,
    JobKey,
    Payload,
    Schedule,
    NextRunAt,
    LockedAt,
    LockedBy,
    LastRunAt,
    LastFinishedAt,
    FailCount,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(DeriveIden)]
enum MonitoringAuditLogs {
    Table,
    Id,
    AnalysisId,
    StrategyId,
    UserId,
    Status,
    Reason,
    Details,
    DurationMs,
    CreatedAt,
}

#[derive(DeriveIden)]
enum StockAnalyses {
    Table,
    Id,
    UserId,
    StockSymbol,
    InstrumentKey,
    Strategies,
    ValidUntil,
    OrdersPlaced,
    OrderPlacementInProgress,
    OrderPlacementStartedAt,
    CreatedAt,
    UpdatedAt,
}
