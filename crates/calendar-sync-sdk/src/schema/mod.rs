//! 同步表注册表与主键类型
//!
//! 取代按表名字符串动态分发：表名、主键、索引、依赖关系在 [`Table`] 中集中声明。

mod key;
mod table;

pub use key::RecordKey;
pub use table::{key_columns_of, push_rank_of, Table, UNKNOWN_TABLE_RANK};
