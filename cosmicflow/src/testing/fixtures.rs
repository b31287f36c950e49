//! Sample requirement, outline and table builders.

use serde_json::json;

use crate::core::{Column, CosmicRow, CosmicTable, FunctionalProcess, RequirementOutline, TriggerEvent, TriggerOutline};
use crate::llm::CompletionRequest;
use crate::pipeline::prompts::{BATCH_EVENTS_HEADING, REVIEW_MARKER};
use crate::testing::ScriptStep;

/// Name of the sample requirement.
pub const SAMPLE_REQUIREMENT: &str = "订单管理系统";

/// Functional user requirement shared by the sample events.
pub const SAMPLE_USER_REQUIREMENT: &str = "订单管理";

/// A requirement with a target of 40 rows.
#[must_use]
pub fn sample_requirement() -> RequirementOutline {
    RequirementOutline::new(SAMPLE_REQUIREMENT, 40)
        .with_background("商家通过线上渠道接收客户订单，需要统一管理订单、支付与商品信息")
        .with_functional_users("客户", SAMPLE_REQUIREMENT)
        .with_detailed_plan("建设订单提交、查询、处理、支付与商品维护功能")
}

const SAMPLE_EVENTS: [(&str, &[&str]); 5] = [
    ("客户提交订单", &["创建订单", "修改订单", "取消订单"]),
    ("客户查询订单", &["查询订单列表", "查看订单详情"]),
    ("商家处理订单", &["确认订单", "发货登记", "拒绝订单"]),
    ("客户支付订单", &["发起支付", "登记支付结果"]),
    ("管理员维护商品", &["新增商品", "修改商品信息", "下架商品"]),
];

/// Five trigger events with 3, 2, 3, 2 and 3 processes (13 in total).
#[must_use]
pub fn sample_outline() -> TriggerOutline {
    let events = SAMPLE_EVENTS
        .iter()
        .enumerate()
        .map(|(i, (name, processes))| {
            let mut event = TriggerEvent::new(format!("TE-{}", i + 1), *name)
                .with_user_requirement(SAMPLE_USER_REQUIREMENT);
            event.functional_users = crate::core::FunctionalUsers::new("客户", SAMPLE_REQUIREMENT);
            processes.iter().enumerate().fold(event, |event, (j, process)| {
                event.with_process(FunctionalProcess::new(format!("FP-{}.{}", i + 1, j + 1), *process))
            })
        })
        .collect();
    TriggerOutline::new(events)
}

/// Three rule-conforming rows (E, R, X) per process of `events`.
#[must_use]
pub fn table_for_events(requirement_name: &str, events: &[TriggerEvent]) -> CosmicTable {
    let mut rows = Vec::new();
    for event in events {
        let users = if event.functional_users.is_empty() {
            crate::core::FunctionalUsers::new("客户", requirement_name).label()
        } else {
            event.functional_users.label()
        };
        let user_requirement = if event.user_requirement.is_empty() {
            event.name.as_str()
        } else {
            event.user_requirement.as_str()
        };
        for process in &event.functional_processes {
            let p = process.description.as_str();
            let movements = [
                ("E", format!("接收{p}请求"), format!("{p}请求数据"), format!("{p}编号、{p}提交时间")),
                ("R", format!("读取{p}存量记录"), format!("{p}存量记录"), format!("{p}记录编号、{p}记录状态")),
                ("X", format!("返回{p}结果"), format!("{p}结果数据"), format!("{p}结果编码、{p}结果说明")),
            ];
            for (kind, sub_process, group, attributes) in movements {
                rows.push(
                    CosmicRow::new()
                        .with(Column::CustomerRequirement, requirement_name)
                        .with(Column::FunctionalUser, users.clone())
                        .with(Column::UserRequirement, user_requirement)
                        .with(Column::TriggerEvent, event.name.clone())
                        .with(Column::FunctionalProcess, p)
                        .with(Column::SubProcess, sub_process)
                        .with(Column::MovementType, kind)
                        .with(Column::DataGroup, group)
                        .with(Column::DataAttributes, attributes)
                        .with(Column::Reuse, "新增")
                        .with(Column::Cfp, "1")
                        .with(Column::TotalCfp, "1"),
                );
            }
        }
    }
    CosmicTable::new(rows)
}

/// A stage 1 answer in the nested layout models usually produce.
#[must_use]
pub fn outline_completion(outline: &TriggerOutline) -> String {
    let events: Vec<serde_json::Value> = outline
        .events
        .iter()
        .map(|event| {
            json!({
                "name": event.name,
                "functional_processes": event
                    .functional_processes
                    .iter()
                    .map(|p| p.description.clone())
                    .collect::<Vec<_>>(),
            })
        })
        .collect();
    let body = json!({
        "functional_user_requirements": [{
            "requirement": SAMPLE_USER_REQUIREMENT,
            "trigger_events": events,
        }]
    });
    format!(
        "以下是触发事件与功能过程：\n```json\n{}\n```",
        serde_json::to_string_pretty(&body).unwrap_or_default()
    )
}

/// A stage 2 answer wrapping `table` in prose.
#[must_use]
pub fn table_completion(table: &CosmicTable) -> String {
    format!("以下是本批次的COSMIC表格：\n\n{}\n以上共{}行。", table.to_markdown(), table.len())
}

/// Reads the batch events embedded in a table generation prompt.
#[must_use]
pub fn batch_events(prompt: &str) -> Option<Vec<TriggerEvent>> {
    let start = prompt.find(BATCH_EVENTS_HEADING)?;
    let rest = &prompt[start..];
    let array = rest.find('[')?;
    serde_json::Deserializer::from_str(&rest[array..])
        .into_iter::<Vec<TriggerEvent>>()
        .next()?
        .ok()
}

/// A responder that plays a well-behaved model for the whole pipeline.
///
/// Review prompts get an empty review, table prompts (and corrections of
/// them) get [`table_for_events`] for the batch, anything else gets the
/// sample outline.
pub fn pipeline_responder(requirement_name: &str) -> impl Fn(&CompletionRequest) -> ScriptStep + Send + Sync + 'static {
    let requirement_name = requirement_name.to_string();
    move |request: &CompletionRequest| {
        let prompt = request.prompt().map(|m| m.content.as_str()).unwrap_or_default();
        if prompt.contains(REVIEW_MARKER) {
            return ScriptStep::reply("[]");
        }
        let batch = request
            .messages
            .iter()
            .rev()
            .find_map(|m| batch_events(&m.content));
        match batch {
            Some(events) => ScriptStep::reply(table_completion(&table_for_events(&requirement_name, &events))),
            None => ScriptStep::reply(outline_completion(&sample_outline())),
        }
    }
}
