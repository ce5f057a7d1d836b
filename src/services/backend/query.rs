//! 查询描述：选择表达式、过滤条件、排序与限制
//!
//! `SelectQuery` 是 `EntityCache::query` 回调拿到的构建器，调用方可以任意追加过滤与排序：
//!
//! ```rust
//! cache.query(|q| q.eq("status", "published").order("created_at", false).limit(20), &options)
//! ```

use serde_json::Value;

/// 过滤运算符（与 PostgREST 运算符一一对应）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterOp {
    Eq,
    Neq,
    Gt,
    Gte,
    Lt,
    Lte,
    Like,
    ILike,
    In,
    Is,
}

impl FilterOp {
    pub fn as_str(&self) -> &'static str {
        match self {
            FilterOp::Eq => "eq",
            FilterOp::Neq => "neq",
            FilterOp::Gt => "gt",
            FilterOp::Gte => "gte",
            FilterOp::Lt => "lt",
            FilterOp::Lte => "lte",
            FilterOp::Like => "like",
            FilterOp::ILike => "ilike",
            FilterOp::In => "in",
            FilterOp::Is => "is",
        }
    }
}

/// 单个过滤条件
#[derive(Debug, Clone, PartialEq)]
pub struct Filter {
    pub column: String,
    pub op: FilterOp,
    /// `In` 时为数组，`Is` 时为 null/bool
    pub value: Value,
}

impl Filter {
    pub fn new(column: impl Into<String>, op: FilterOp, value: impl Into<Value>) -> Self {
        Self {
            column: column.into(),
            op,
            value: value.into(),
        }
    }

    pub fn eq(column: impl Into<String>, value: impl Into<Value>) -> Self {
        Self::new(column, FilterOp::Eq, value)
    }

    pub fn in_list(column: impl Into<String>, values: Vec<Value>) -> Self {
        Self::new(column, FilterOp::In, Value::Array(values))
    }
}

/// 排序条件
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Order {
    pub column: String,
    pub ascending: bool,
}

/// 查询构建器
#[derive(Debug, Clone, PartialEq, Default)]
pub struct SelectQuery {
    /// 选择表达式，如 `*,users(*)`
    pub columns: String,
    pub filters: Vec<Filter>,
    pub order: Vec<Order>,
    pub limit: Option<usize>,
}

impl SelectQuery {
    pub fn new(columns: impl Into<String>) -> Self {
        Self {
            columns: columns.into(),
            ..Default::default()
        }
    }

    pub fn filter(mut self, filter: Filter) -> Self {
        self.filters.push(filter);
        self
    }

    pub fn eq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, FilterOp::Eq, value))
    }

    pub fn neq(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, FilterOp::Neq, value))
    }

    pub fn gt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, FilterOp::Gt, value))
    }

    pub fn gte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, FilterOp::Gte, value))
    }

    pub fn lt(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, FilterOp::Lt, value))
    }

    pub fn lte(self, column: &str, value: impl Into<Value>) -> Self {
        self.filter(Filter::new(column, FilterOp::Lte, value))
    }

    /// `%` 通配，大小写敏感
    pub fn like(self, column: &str, pattern: &str) -> Self {
        self.filter(Filter::new(column, FilterOp::Like, pattern))
    }

    /// `%` 通配，忽略大小写
    pub fn ilike(self, column: &str, pattern: &str) -> Self {
        self.filter(Filter::new(column, FilterOp::ILike, pattern))
    }

    pub fn in_list(self, column: &str, values: Vec<Value>) -> Self {
        self.filter(Filter::in_list(column, values))
    }

    pub fn is_null(self, column: &str) -> Self {
        self.filter(Filter::new(column, FilterOp::Is, Value::Null))
    }

    pub fn order(mut self, column: &str, ascending: bool) -> Self {
        self.order.push(Order {
            column: column.to_string(),
            ascending,
        });
        self
    }

    pub fn limit(mut self, limit: usize) -> Self {
        self.limit = Some(limit);
        self
    }
}

/// 解析后的选择表达式
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Selection {
    /// 是否包含 `*`
    pub all_columns: bool,
    /// 显式列出的列
    pub columns: Vec<String>,
    /// 嵌入的关联表（`users(*)` → `users`）
    pub embeds: Vec<String>,
}

/// 解析选择表达式，只在顶层逗号处切分（括号内为嵌入表的子选择）
pub fn parse_selection(expr: &str) -> Selection {
    let mut selection = Selection::default();
    let mut depth = 0usize;
    let mut current = String::new();
    let mut items = Vec::new();

    for ch in expr.chars() {
        match ch {
            '(' => {
                depth += 1;
                current.push(ch);
            }
            ')' => {
                depth = depth.saturating_sub(1);
                current.push(ch);
            }
            ',' if depth == 0 => items.push(std::mem::take(&mut current)),
            _ => current.push(ch),
        }
    }
    items.push(current);

    for item in items {
        let item = item.trim();
        if item.is_empty() {
            continue;
        }
        if item == "*" {
            selection.all_columns = true;
        } else if let Some(open) = item.find('(') {
            selection.embeds.push(item[..open].trim().to_string());
        } else {
            selection.columns.push(item.to_string());
        }
    }

    selection
}
