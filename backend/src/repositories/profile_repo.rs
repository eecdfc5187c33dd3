use sqlx::SqlitePool;

use crate::db::models::UserProfile;
use crate::error::AppError;

#[derive(Clone)]
pub struct ProfileRepo {
    read_pool: SqlitePool,
    write_pool: SqlitePool,
}

impl ProfileRepo {
    pub fn new(pool: SqlitePool) -> Self {
        Self {
            read_pool: pool.clone(),
            write_pool: pool,
        }
    }

    pub fn with_pools(read_pool: SqlitePool, write_pool: SqlitePool) -> Self {
        Self {
            read_pool,
            write_pool,
        }
    }

    pub async fn get_profile(&self, user_id: &str) -> Result<Option<UserProfile>, AppError> {
        let row =
            sqlx::query_as::<_, UserProfile>("SELECT * FROM user_profiles WHERE user_id = ?1")
                .bind(user_id)
                .fetch_optional(&self.read_pool)
                .await?;
        Ok(row)
    }

    pub async fn upsert_profile(&self, profile: &UserProfile) -> Result<(), AppError> {
        sqlx::query(
            r#"
            INSERT INTO user_profiles (
                user_id, communication_style, interests, expertise_areas,
                personality_traits, preferences, updated_at
            )
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, datetime('now','utc'))
            ON CONFLICT(user_id)
            DO UPDATE SET
                communication_style = excluded.communication_style,
                interests = excluded.interests,
                expertise_areas = excluded.expertise_areas,
                personality_traits = excluded.personality_traits,
                preferences = excluded.preferences,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(&profile.user_id)
        .bind(&profile.communication_style)
        .bind(&profile.interests)
        .bind(&profile.expertise_areas)
        .bind(&profile.personality_traits)
        .bind(&profile.preferences)
        .execute(&self.write_pool)
        .await?;
        Ok(())
    }
}
