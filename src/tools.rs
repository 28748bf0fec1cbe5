use schemars::JsonSchema;
use serde_json::{json, Value};

use crate::claude::ToolSchema;

pub const SCREENSHOT: &str = "screenshot";
pub const MOUSE_MOVE: &str = "mouse_move";
pub const CLICK: &str = "click";
pub const DOUBLE_CLICK: &str = "double_click";
pub const TYPE: &str = "type";
pub const KEY: &str = "key";
pub const SCROLL: &str = "scroll";

pub fn custom_tool_schema(name: &str, description: &str, input_schema: Value) -> ToolSchema {
    ToolSchema {
        name: name.to_string(),
        description: description.to_string(),
        input_schema,
    }
}

/// Object schema for `T`, without the `$schema` dialect marker.
pub fn schema_for<T: JsonSchema>() -> Value {
    let schema = schemars::schema_for!(T);
    let mut v = serde_json::to_value(&schema).unwrap_or_else(|_| json!({ "type": "object" }));
    if let Some(obj) = v.as_object_mut() {
        obj.remove("$schema");
    }
    v
}

fn point_properties(verb: &str) -> Value {
    json!({
        "x": { "type": "integer", "description": format!("X coordinate to {verb}") },
        "y": { "type": "integer", "description": format!("Y coordinate to {verb}") },
    })
}

fn object(properties: Value, required: &[&str]) -> Value {
    json!({
        "type": "object",
        "properties": properties,
        "required": required,
    })
}

fn merge(mut base: Value, extra: Value) -> Value {
    if let (Some(b), Some(e)) = (base.as_object_mut(), extra.as_object()) {
        for (k, v) in e {
            b.insert(k.clone(), v.clone());
        }
    }
    base
}

/// Schemas for the actions the agent performs itself, in the order they are
/// offered to the model.
pub fn builtin_tools() -> Vec<ToolSchema> {
    vec![
        custom_tool_schema(
            SCREENSHOT,
            "Take a screenshot of the current screen",
            json!({ "type": "object", "properties": {} }),
        ),
        custom_tool_schema(
            MOUSE_MOVE,
            "Move the mouse cursor to specific coordinates",
            object(
                merge(
                    point_properties("move to"),
                    json!({
                        "duration": {
                            "type": "number",
                            "description": "Duration of movement in seconds",
                            "default": 0.5
                        }
                    }),
                ),
                &["x", "y"],
            ),
        ),
        custom_tool_schema(
            CLICK,
            "Click at specific coordinates",
            object(
                merge(
                    point_properties("click"),
                    json!({
                        "button": {
                            "type": "string",
                            "enum": ["left", "right", "middle"],
                            "description": "Mouse button to click",
                            "default": "left"
                        },
                        "clicks": {
                            "type": "integer",
                            "description": "Number of clicks",
                            "default": 1
                        }
                    }),
                ),
                &["x", "y"],
            ),
        ),
        custom_tool_schema(
            DOUBLE_CLICK,
            "Double click with the left button at specific coordinates",
            object(point_properties("double click"), &["x", "y"]),
        ),
        custom_tool_schema(
            TYPE,
            "Type text using the keyboard",
            object(
                json!({
                    "text": { "type": "string", "description": "Text to type" },
                    "interval": {
                        "type": "number",
                        "description": "Interval between keystrokes in seconds",
                        "default": 0.0
                    }
                }),
                &["text"],
            ),
        ),
        custom_tool_schema(
            KEY,
            "Press a keyboard key",
            object(
                json!({
                    "key": {
                        "type": "string",
                        "description": "Key to press (e.g., 'enter', 'tab', 'escape', 'backspace')"
                    }
                }),
                &["key"],
            ),
        ),
        custom_tool_schema(
            SCROLL,
            "Scroll in a direction",
            object(
                json!({
                    "direction": {
                        "type": "string",
                        "enum": ["up", "down", "left", "right"],
                        "description": "Direction to scroll"
                    },
                    "amount": {
                        "type": "integer",
                        "description": "Amount to scroll (number of clicks)",
                        "default": 3
                    },
                    "x": { "type": "integer", "description": "Optional X coordinate to scroll at" },
                    "y": { "type": "integer", "description": "Optional Y coordinate to scroll at" }
                }),
                &["direction"],
            ),
        ),
    ]
}
