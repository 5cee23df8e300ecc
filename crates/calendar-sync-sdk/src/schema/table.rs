//! 同步表注册表 - 受控枚举
//!
//! 所有参与本地镜像与同步的表都在这里登记：表名、主键列（单列或复合）、归属列、
//! 二级索引、外键依赖与推送顺序。新增表需同时添加 migration。

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::RecordKey;
use crate::error::{CalendarSyncError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Table {
    #[serde(rename = "profiles")]
    Profile,
    #[serde(rename = "calendars")]
    Calendar,
    #[serde(rename = "categories")]
    Category,
    #[serde(rename = "personas")]
    Persona,
    #[serde(rename = "annotations")]
    Annotation,
    #[serde(rename = "work_periods")]
    WorkPeriod,
    #[serde(rename = "events")]
    Event,
    #[serde(rename = "event_details")]
    EventDetail,
    #[serde(rename = "event_participant_roles")]
    EventParticipantRole,
    #[serde(rename = "event_responses")]
    EventResponse,
}

/// 未登记表（旧版本遗留在 outbox 中）的推送顺序：排在最后
pub const UNKNOWN_TABLE_RANK: u8 = u8::MAX;

const ID_KEY: &[&str] = &["id"];

impl Table {
    /// 依赖顺序：基础实体 → 引用它们的实体 → 明细/关联表
    pub const ALL: [Table; 10] = [
        Table::Profile,
        Table::Calendar,
        Table::Category,
        Table::Persona,
        Table::Annotation,
        Table::WorkPeriod,
        Table::Event,
        Table::EventDetail,
        Table::EventParticipantRole,
        Table::EventResponse,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Profile => "profiles",
            Self::Calendar => "calendars",
            Self::Category => "categories",
            Self::Persona => "personas",
            Self::Annotation => "annotations",
            Self::WorkPeriod => "work_periods",
            Self::Event => "events",
            Self::EventDetail => "event_details",
            Self::EventParticipantRole => "event_participant_roles",
            Self::EventResponse => "event_responses",
        }
    }

    /// 主键列（有序）；两列即复合主键
    pub fn key_columns(self) -> &'static [&'static str] {
        match self {
            Self::EventDetail => &["event_id"],
            Self::EventParticipantRole => &["event_id", "persona_id"],
            Self::EventResponse => &["event_id", "user_id"],
            _ => ID_KEY,
        }
    }

    pub fn is_composite_key(self) -> bool {
        self.key_columns().len() > 1
    }

    /// 行归属列：pull 的范围过滤、delete 的用户范围
    pub fn owner_column(self) -> &'static str {
        match self {
            Self::Profile => "id",
            _ => "user_id",
        }
    }

    /// 可用于 `LocalStore::query` 的二级索引（data 中的 JSON 字段）
    pub fn indexes(self) -> &'static [&'static str] {
        match self {
            Self::Profile => &[],
            Self::Calendar | Self::Category | Self::Persona => &["user_id"],
            Self::Annotation => &["user_id", "start_time"],
            Self::WorkPeriod => &["user_id", "weekday"],
            Self::Event => &["calendar_id", "category_id", "start_time"],
            Self::EventDetail => &["user_id"],
            Self::EventParticipantRole => &["event_id", "persona_id"],
            Self::EventResponse => &["event_id", "user_id", "status"],
        }
    }

    pub fn has_index(self, field: &str) -> bool {
        field == "updated_at" || self.indexes().contains(&field)
    }

    /// 远端外键依赖（直接依赖）
    pub fn depends_on(self) -> &'static [Table] {
        match self {
            Self::Profile => &[],
            Self::Calendar | Self::Category | Self::Persona | Self::Annotation | Self::WorkPeriod => {
                &[Table::Profile]
            }
            Self::Event => &[Table::Profile, Table::Calendar, Table::Category],
            Self::EventDetail => &[Table::Event, Table::Calendar, Table::Category],
            Self::EventParticipantRole => &[Table::Event, Table::Persona],
            Self::EventResponse => &[Table::Event],
        }
    }

    /// 是否（传递地）依赖 `other`
    pub fn depends_transitively_on(self, other: Table) -> bool {
        self.depends_on()
            .iter()
            .any(|&dep| dep == other || dep.depends_transitively_on(other))
    }

    pub fn push_rank(self) -> u8 {
        match self {
            Self::Profile => 0,
            Self::Calendar | Self::Category | Self::Persona | Self::Annotation | Self::WorkPeriod => 1,
            Self::Event => 2,
            Self::EventDetail | Self::EventParticipantRole | Self::EventResponse => 3,
        }
    }

    /// 服务端多表组合的聚合资源：逐条走专用端点，而不是批量 upsert
    pub fn composite_route(self) -> Option<&'static str> {
        match self {
            Self::Event => Some("events"),
            _ => None,
        }
    }

    /// 从行数据中取主键
    pub fn key_of(self, row: &Map<String, Value>) -> Result<RecordKey> {
        RecordKey::from_row(self.key_columns(), row).ok_or_else(|| {
            CalendarSyncError::InvalidArgument(format!(
                "{} 行缺少主键列 {:?}",
                self.as_str(),
                self.key_columns()
            ))
        })
    }

    /// 主键 → {列: 值}
    pub fn key_fields(self, key: &RecordKey) -> Map<String, Value> {
        key.to_fields(self.key_columns())
    }
}

impl FromStr for Table {
    type Err = ();

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Table::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or(())
    }
}

impl std::fmt::Display for Table {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// 按表名给出推送顺序；未登记表排最后
pub fn push_rank_of(table_name: &str) -> u8 {
    Table::from_str(table_name)
        .map(Table::push_rank)
        .unwrap_or(UNKNOWN_TABLE_RANK)
}

/// 按表名给出主键列；未登记表按单列 `id` 处理
pub fn key_columns_of(table_name: &str) -> &'static [&'static str] {
    Table::from_str(table_name)
        .map(Table::key_columns)
        .unwrap_or(ID_KEY)
}
