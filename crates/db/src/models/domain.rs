use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::{FromRow, SqlitePool};
use ts_rs::TS;
use uuid::Uuid;

/// Project/category container owning tasks. Archived rather than hard-deleted.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize, TS)]
pub struct Domain {
    pub id: Uuid,
    pub user_id: Uuid,
    pub name: String,
    pub description: Option<String>,
    pub archived: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, TS)]
pub struct CreateDomain {
    pub name: String,
    pub description: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, TS)]
pub struct UpdateDomain {
    pub name: Option<String>,
    pub description: Option<String>,
}

const DOMAIN_COLUMNS: &str = "id, user_id, name, description, archived, created_at, updated_at";

impl Domain {
    pub async fn create(
        pool: &SqlitePool,
        user_id: Uuid,
        data: &CreateDomain,
    ) -> Result<Domain, sqlx::Error> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO domains (id, user_id, name, description, archived, created_at, updated_at)
             VALUES ($1, $2, $3, $4, 0, $5, $5)",
        )
        .bind(id)
        .bind(user_id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(now)
        .execute(pool)
        .await?;

        Ok(Domain {
            id,
            user_id,
            name: data.name.clone(),
            description: data.description.clone(),
            archived: false,
            created_at: now,
            updated_at: now,
        })
    }

    pub async fn find_by_id(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
    ) -> Result<Option<Domain>, sqlx::Error> {
        sqlx::query_as::<_, Domain>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains WHERE id = $1 AND user_id = $2"
        ))
        .bind(id)
        .bind(user_id)
        .fetch_optional(pool)
        .await
    }

    pub async fn find_by_user_id(
        pool: &SqlitePool,
        user_id: Uuid,
        include_archived: bool,
    ) -> Result<Vec<Domain>, sqlx::Error> {
        sqlx::query_as::<_, Domain>(&format!(
            "SELECT {DOMAIN_COLUMNS} FROM domains
              WHERE user_id = $1 AND (archived = 0 OR $2)
              ORDER BY created_at ASC"
        ))
        .bind(user_id)
        .bind(include_archived)
        .fetch_all(pool)
        .await
    }

    pub async fn update(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
        data: &UpdateDomain,
    ) -> Result<(), sqlx::Error> {
        sqlx::query(
            "UPDATE domains
                SET name = COALESCE($3, name),
                    description = COALESCE($4, description),
                    updated_at = $5
              WHERE id = $1 AND user_id = $2",
        )
        .bind(id)
        .bind(user_id)
        .bind(&data.name)
        .bind(&data.description)
        .bind(Utc::now())
        .execute(pool)
        .await?;
        Ok(())
    }

    pub async fn set_archived(
        pool: &SqlitePool,
        id: Uuid,
        user_id: Uuid,
        archived: bool,
    ) -> Result<(), sqlx::Error> {
        sqlx::query("UPDATE domains SET archived = $3, updated_at = $4 WHERE id = $1 AND user_id = $2")
            .bind(id)
            .bind(user_id)
            .bind(archived)
            .bind(Utc::now())
            .execute(pool)
            .await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        DBService,
        models::user::{CreateUser, User},
    };

    #[tokio::test]
    async fn test_archive_hides_domain_from_default_listing() {
        let db = DBService::in_memory().await.unwrap();
        let user = User::create(
            &db.pool,
            &CreateUser {
                email: "d@example.com".to_string(),
                display_name: None,
            },
        )
        .await
        .unwrap();

        let domain = Domain::create(
            &db.pool,
            user.id,
            &CreateDomain {
                name: "Work".to_string(),
                description: None,
            },
        )
        .await
        .unwrap();

        Domain::set_archived(&db.pool, domain.id, user.id, true)
            .await
            .unwrap();

        let active = Domain::find_by_user_id(&db.pool, user.id, false).await.unwrap();
        assert!(active.is_empty());

        let all = Domain::find_by_user_id(&db.pool, user.id, true).await.unwrap();
        assert_eq!(all.len(), 1);
        assert!(all[0].archived);
    }
}
