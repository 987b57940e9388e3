use sea_orm_migration::prelude::*;

use crate::settings::DEFAULT_SETTINGS;

#[derive(DeriveMigrationName)]
pub struct Migration;

#[async_trait::async_trait]
impl MigrationTrait for Migration {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // ── sessions ──
        manager
            .create_table(
                Table::create()
                    .table(Sessions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(Sessions::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(Sessions::UserId).integer().not_null())
                    .col(
                        ColumnDef::new(Sessions::TokenHash)
                            .string()
                            .not_null()
                            .unique_key(),
                    )
                    .col(ColumnDef::new(Sessions::CreatedAt).timestamp().not_null())
                    .col(
                        ColumnDef::new(Sessions::LastActivityAt)
                            .timestamp()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Sessions::ExpiresAt).timestamp().not_null())
                    .col(
                        ColumnDef::new(Sessions::RememberMe)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(ColumnDef::new(Sessions::IpAddress).string().null())
                    .col(ColumnDef::new(Sessions::BoundIp).string().null())
                    .col(ColumnDef::new(Sessions::UserAgent).string().null())
                    .col(
                        ColumnDef::new(Sessions::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_user_id")
                    .table(Sessions::Table)
                    .col(Sessions::UserId)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_expires_at")
                    .table(Sessions::Table)
                    .col(Sessions::ExpiresAt)
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .if_not_exists()
                    .name("idx_sessions_user_active_activity")
                    .table(Sessions::Table)
                    .col(Sessions::UserId)
                    .col(Sessions::IsActive)
                    .col(Sessions::LastActivityAt)
                    .to_owned(),
            )
            .await?;

        // ── login_logs ──
        manager
            .create_table(
                Table::create()
                    .table(LoginLogs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(LoginLogs::Id)
                            .integer()
                            .not_null()
                            .auto_increment()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(LoginLogs::UserId).integer().null())
                    .col(
                        ColumnDef::new(LoginLogs::Login)
                            .string()
                            .not_null()
                            .default(""),
                    )
                    .col(ColumnDef::new(LoginLogs::Action).string().not_null())
                    .col(ColumnDef::new(LoginLogs::IpAddress).string().null())
                    .col(ColumnDef::new(LoginLogs::UserAgent).string().null())
                    .col(ColumnDef::new(LoginLogs::SessionToken).string().null())
                    .col(ColumnDef::new(LoginLogs::Success).boolean().not_null())
                    .col(ColumnDef::new(LoginLogs::Reason).string().null())
                    .col(ColumnDef::new(LoginLogs::Detail).text().null())
                    .col(ColumnDef::new(LoginLogs::CreatedAt).timestamp().not_null())
                    .to_owned(),
            )
            .await?;

        for (name, column) in [
            ("idx_login_logs_user_id", LoginLogs::UserId),
            ("idx_login_logs_action", LoginLogs::Action),
            ("idx_login_logs_created_at", LoginLogs::CreatedAt),
            ("idx_login_logs_ip_address", LoginLogs::IpAddress),
        ] {
            manager
                .create_index(
                    Index::create()
                        .if_not_exists()
                        .name(name)
                        .table(LoginLogs::Table)
                        .col(column)
                        .to_owned(),
                )
                .await?;
        }

        // ── session_policy ──
        manager
            .create_table(
                Table::create()
                    .table(SessionPolicy::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(SessionPolicy::Key)
                            .string()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(SessionPolicy::Value).string().not_null())
                    .col(ColumnDef::new(SessionPolicy::Description).string().null())
                    .col(
                        ColumnDef::new(SessionPolicy::UpdatedAt)
                            .timestamp()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        let now = chrono::Utc::now().naive_utc();
        let mut seed = Query::insert();
        seed.into_table(SessionPolicy::Table).columns([
            SessionPolicy::Key,
            SessionPolicy::Value,
            SessionPolicy::Description,
            SessionPolicy::UpdatedAt,
        ]);
        for (key, value, description) in DEFAULT_SETTINGS {
            seed.values([
                (*key).into(),
                (*value).into(),
                (*description).into(),
                now.into(),
            ])
            .map_err(|e| DbErr::Migration(e.to_string()))?;
        }
        seed.on_conflict(
            OnConflict::column(SessionPolicy::Key)
                .do_nothing()
                .to_owned(),
        );

        manager.exec_stmt(seed).await
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(SessionPolicy::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(LoginLogs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Sessions::Table).to_owned())
            .await
    }
}

#[derive(Iden)]
enum Sessions {
    Table,
    Id,
    UserId,
    TokenHash,
    CreatedAt,
    LastActivityAt,
    ExpiresAt,
    RememberMe,
    IpAddress,
    BoundIp,
    UserAgent,
    IsActive,
}

#[derive(Iden)]
enum LoginLogs {
    Table,
    Id,
    UserId,
    Login,
    Action,
    IpAddress,
    UserAgent,
    SessionToken,
    Success,
    Reason,
    Detail,
    CreatedAt,
}

#[derive(Iden)]
enum SessionPolicy {
    Table,
    Key,
    Value,
    Description,
    UpdatedAt,
}
