use serde::{Deserialize, Serialize};
use serde_json::Value;

// ==================== Calls ====================

/// 调用请求 (`call` 事件的 data)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallPayload {
    /// 目标端点名称
    pub method: String,
    pub params: Value,
    /// 关联 ID，响应事件为 `response.<callId>`
    pub call_id: String,
    /// 附带的依赖查询，服务器与本次调用原子地计算并返回
    #[serde(default)]
    pub side_effects: Vec<SideEffect>,
}

/// 附带查询
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffect {
    /// 在调用方 side effect 列表中的下标
    pub side_effect_id: u32,
    pub method: String,
    pub params: Value,
}

/// 成功的调用响应
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CallResponse {
    pub mutation_result: Value,
    #[serde(default)]
    pub side_effect_results: Vec<SideEffectResult>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SideEffectResult {
    pub side_effect_id: u32,
    pub result: Value,
}

// ==================== Streams ====================

/// 流占位字段：`mutationResult` 顶层字段值为 `{"__moopsyStream": "<streamId>"}` 时
/// 表示该字段是一个流，数据经 `response.<callId>.<streamId>` 推送
pub const STREAM_MARKER: &str = "__moopsyStream";

/// 返回流 ID（若该值是流占位）
pub fn stream_marker(value: &Value) -> Option<&str> {
    value.as_object()?.get(STREAM_MARKER)?.as_str()
}

/// 流数据块
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StreamChunk {
    #[serde(default)]
    pub backlog: Vec<Value>,
    #[serde(default)]
    pub ended: bool,
}

// ==================== Pub/Sub ====================

/// 订阅主题
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscribeToTopicPayload {
    pub topic: String,
    /// 主题规格 ID (服务器按此查找处理器)
    pub topic_id: String,
    #[serde(default)]
    pub params: Value,
}

/// 向主题发布消息
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublishToTopicPayload {
    pub topic: String,
    pub topic_id: String,
    pub data: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_call_payload_wire_names() {
        let payload = CallPayload {
            method: "orders.create".into(),
            params: json!({"qty": 2}),
            call_id: "7".into(),
            side_effects: vec![SideEffect {
                side_effect_id: 0,
                method: "orders.list".into(),
                params: json!({}),
            }],
        };
        assert_eq!(
            serde_json::to_value(&payload).unwrap(),
            json!({
                "method": "orders.create",
                "params": {"qty": 2},
                "callId": "7",
                "sideEffects": [{"sideEffectId": 0, "method": "orders.list", "params": {}}]
            })
        );
    }

    #[test]
    fn test_response_without_side_effects() {
        let resp: CallResponse = serde_json::from_value(json!({"mutationResult": 5})).unwrap();
        assert_eq!(resp.mutation_result, json!(5));
        assert!(resp.side_effect_results.is_empty());
    }

    #[test]
    fn test_stream_marker_detection() {
        assert_eq!(stream_marker(&json!({"__moopsyStream": "s1"})), Some("s1"));
        assert_eq!(stream_marker(&json!({"__moopsyStream": 3})), None);
        assert_eq!(stream_marker(&json!({"__stream": "s1"})), None);
        assert_eq!(stream_marker(&json!("s1")), None);
    }
}
