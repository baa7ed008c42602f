use std::collections::HashMap;
use std::error::Error as StdError;
use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Error {
    HtmlParse(String),
    UnsupportedSelector(String),
    ElementNotFound(String),
    AmbiguousTarget {
        selector: String,
        matches: usize,
    },
    CapabilityUnavailable(String),
    PageRuntime(String),
    AssertionFailed {
        selector: String,
        expected: String,
        actual: String,
        dom_snippet: String,
    },
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::HtmlParse(msg) => write!(f, "html parse error: {msg}"),
            Self::UnsupportedSelector(selector) => write!(f, "unsupported selector: {selector}"),
            Self::ElementNotFound(selector) => write!(f, "element not found: {selector}"),
            Self::AmbiguousTarget { selector, matches } => write!(
                f,
                "selector must match exactly one element: {selector} matched {matches}"
            ),
            Self::CapabilityUnavailable(capability) => {
                write!(f, "capability unavailable: {capability}")
            }
            Self::PageRuntime(msg) => write!(f, "page runtime error: {msg}"),
            Self::AssertionFailed {
                selector,
                expected,
                actual,
                dom_snippet,
            } => write!(
                f,
                "assertion failed for {selector}: expected {expected}, actual {actual}, snippet {dom_snippet}"
            ),
        }
    }
}

impl StdError for Error {}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct NodeId(usize);

#[derive(Debug, Clone)]
enum NodeType {
    Document,
    Element(Element),
    Text(String),
}

#[derive(Debug, Clone)]
struct Node {
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    node_type: NodeType,
}

#[derive(Debug, Clone)]
struct Element {
    tag_name: String,
    attrs: HashMap<String, String>,
}

#[derive(Debug, Clone)]
struct Dom {
    nodes: Vec<Node>,
    root: NodeId,
    id_index: HashMap<String, NodeId>,
}

impl Dom {
    fn new() -> Self {
        let root = Node {
            parent: None,
            children: Vec::new(),
            node_type: NodeType::Document,
        };
        Self {
            nodes: vec![root],
            root: NodeId(0),
            id_index: HashMap::new(),
        }
    }

    fn create_node(&mut self, parent: Option<NodeId>, node_type: NodeType) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(Node {
            parent,
            children: Vec::new(),
            node_type,
        });
        if let Some(parent_id) = parent {
            self.nodes[parent_id.0].children.push(id);
        }
        id
    }

    fn create_element(
        &mut self,
        parent: NodeId,
        tag_name: String,
        attrs: HashMap<String, String>,
    ) -> NodeId {
        let element = Element { tag_name, attrs };
        let id = self.create_node(Some(parent), NodeType::Element(element));
        if let Some(id_attr) = self
            .element(id)
            .and_then(|element| element.attrs.get("id").cloned())
        {
            self.id_index.insert(id_attr, id);
        }
        id
    }

    fn create_text(&mut self, parent: NodeId, text: String) -> NodeId {
        self.create_node(Some(parent), NodeType::Text(text))
    }

    fn element(&self, node_id: NodeId) -> Option<&Element> {
        match &self.nodes[node_id.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn element_mut(&mut self, node_id: NodeId) -> Option<&mut Element> {
        match &mut self.nodes[node_id.0].node_type {
            NodeType::Element(element) => Some(element),
            _ => None,
        }
    }

    fn tag_name(&self, node_id: NodeId) -> Option<&str> {
        self.element(node_id).map(|e| e.tag_name.as_str())
    }

    fn parent(&self, node_id: NodeId) -> Option<NodeId> {
        self.nodes[node_id.0].parent
    }

    fn parent_element(&self, node_id: NodeId) -> Option<NodeId> {
        self.parent(node_id)
            .filter(|parent| self.element(*parent).is_some())
    }

    fn by_id(&self, id: &str) -> Option<NodeId> {
        self.id_index.get(id).copied()
    }

    fn is_attached(&self, node_id: NodeId) -> bool {
        let mut cursor = Some(node_id);
        while let Some(current) = cursor {
            if current == self.root {
                return true;
            }
            cursor = self.parent(current);
        }
        false
    }

    fn detach(&mut self, node_id: NodeId) -> Result<()> {
        if node_id == self.root {
            return Err(Error::PageRuntime("cannot remove document root".into()));
        }
        let Some(parent) = self.parent(node_id) else {
            return Ok(());
        };
        self.nodes[parent.0]
            .children
            .retain(|child| *child != node_id);
        self.nodes[node_id.0].parent = None;
        Ok(())
    }

    fn class_contains(&self, node_id: NodeId, class_name: &str) -> Result<bool> {
        let element = self
            .element(node_id)
            .ok_or_else(|| Error::PageRuntime("class target is not an element".into()))?;
        Ok(has_class(element, class_name))
    }

    fn class_add(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::PageRuntime("class target is not an element".into()))?;
        let mut classes = class_tokens(element.attrs.get("class").map(String::as_str));
        if !classes.iter().any(|name| name == class_name) {
            classes.push(class_name.to_string());
        }
        set_class_attr(element, &classes);
        Ok(())
    }

    fn class_remove(&mut self, node_id: NodeId, class_name: &str) -> Result<()> {
        let element = self
            .element_mut(node_id)
            .ok_or_else(|| Error::PageRuntime("class target is not an element".into()))?;
        let mut classes = class_tokens(element.attrs.get("class").map(String::as_str));
        classes.retain(|name| name != class_name);
        set_class_attr(element, &classes);
        Ok(())
    }

    fn query_selector(&self, selector: &str) -> Result<Option<NodeId>> {
        let all = self.query_selector_all(selector)?;
        Ok(all.into_iter().next())
    }

    fn query_selector_all(&self, selector: &str) -> Result<Vec<NodeId>> {
        let groups = parse_selector_groups(selector)?;

        if groups.len() == 1 && groups[0].len() == 1 {
            if let Some(id) = groups[0][0].step.id_only() {
                return Ok(self
                    .by_id(id)
                    .filter(|node| self.is_attached(*node))
                    .into_iter()
                    .collect());
            }
        }

        let mut ids = Vec::new();
        self.collect_elements_dfs(self.root, &mut ids);

        let mut matched = Vec::new();
        for candidate in ids {
            if groups
                .iter()
                .any(|parts| self.chain_matches(candidate, parts))
            {
                matched.push(candidate);
            }
        }
        Ok(matched)
    }

    fn collect_elements_dfs(&self, node_id: NodeId, out: &mut Vec<NodeId>) {
        for child in &self.nodes[node_id.0].children {
            if self.element(*child).is_some() {
                out.push(*child);
            }
            self.collect_elements_dfs(*child, out);
        }
    }

    fn chain_matches(&self, node_id: NodeId, parts: &[SelectorPart]) -> bool {
        let Some((last, rest)) = parts.split_last() else {
            return false;
        };
        if !self.step_matches(node_id, &last.step) {
            return false;
        }
        if rest.is_empty() {
            return true;
        }
        match last.combinator {
            SelectorCombinator::Child => self
                .parent_element(node_id)
                .is_some_and(|parent| self.chain_matches(parent, rest)),
            SelectorCombinator::Descendant => {
                let mut cursor = self.parent_element(node_id);
                while let Some(ancestor) = cursor {
                    if self.chain_matches(ancestor, rest) {
                        return true;
                    }
                    cursor = self.parent_element(ancestor);
                }
                false
            }
        }
    }

    fn step_matches(&self, node_id: NodeId, step: &SelectorStep) -> bool {
        let Some(element) = self.element(node_id) else {
            return false;
        };
        if let Some(tag) = &step.tag {
            if !element.tag_name.eq_ignore_ascii_case(tag) {
                return false;
            }
        }
        if let Some(id) = &step.id {
            if element.attrs.get("id").map(String::as_str) != Some(id.as_str()) {
                return false;
            }
        }
        step.classes.iter().all(|class| has_class(element, class))
    }

    fn graft(&mut self, source: &Dom, source_node: NodeId, parent: NodeId) {
        match &source.nodes[source_node.0].node_type {
            NodeType::Document => {
                for child in &source.nodes[source_node.0].children {
                    self.graft(source, *child, parent);
                }
            }
            NodeType::Text(text) => {
                self.create_text(parent, text.clone());
            }
            NodeType::Element(element) => {
                let node =
                    self.create_element(parent, element.tag_name.clone(), element.attrs.clone());
                for child in &source.nodes[source_node.0].children {
                    self.graft(source, *child, node);
                }
            }
        }
    }

    fn dump_node(&self, node_id: NodeId) -> String {
        match &self.nodes[node_id.0].node_type {
            NodeType::Document => {
                let mut out = String::new();
                for child in &self.nodes[node_id.0].children {
                    out.push_str(&self.dump_node(*child));
                }
                out
            }
            NodeType::Text(text) => text.clone(),
            NodeType::Element(element) => {
                let mut out = String::new();
                out.push('<');
                out.push_str(&element.tag_name);
                for (k, v) in &element.attrs {
                    out.push(' ');
                    out.push_str(k);
                    out.push_str("=\"");
                    out.push_str(v);
                    out.push('"');
                }
                out.push('>');
                for child in &self.nodes[node_id.0].children {
                    out.push_str(&self.dump_node(*child));
                }
                out.push_str("</");
                out.push_str(&element.tag_name);
                out.push('>');
                out
            }
        }
    }
}

fn has_class(element: &Element, class_name: &str) -> bool {
    element
        .attrs
        .get("class")
        .map(|classes| classes.split_whitespace().any(|c| c == class_name))
        .unwrap_or(false)
}

fn class_tokens(class_attr: Option<&str>) -> Vec<String> {
    class_attr
        .map(|value| {
            value
                .split_whitespace()
                .filter(|token| !token.is_empty())
                .map(ToOwned::to_owned)
                .collect::<Vec<_>>()
        })
        .unwrap_or_default()
}

fn set_class_attr(element: &mut Element, classes: &[String]) {
    if classes.is_empty() {
        element.attrs.remove("class");
    } else {
        element.attrs.insert("class".to_string(), classes.join(" "));
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct SelectorStep {
    tag: Option<String>,
    universal: bool,
    id: Option<String>,
    classes: Vec<String>,
}

impl SelectorStep {
    fn id_only(&self) -> Option<&str> {
        if !self.universal && self.tag.is_none() && self.classes.is_empty() {
            self.id.as_deref()
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SelectorCombinator {
    Descendant,
    Child,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct SelectorPart {
    combinator: SelectorCombinator,
    step: SelectorStep,
}

fn parse_selector_groups(selector: &str) -> Result<Vec<Vec<SelectorPart>>> {
    let mut groups = Vec::new();
    for group in selector.split(',') {
        groups.push(parse_selector_parts(group, selector)?);
    }
    Ok(groups)
}

fn parse_selector_parts(group: &str, full_selector: &str) -> Result<Vec<SelectorPart>> {
    let bytes = group.as_bytes();
    let mut i = 0usize;
    let mut parts: Vec<SelectorPart> = Vec::new();
    let mut pending = SelectorCombinator::Descendant;
    let mut pending_explicit = false;

    loop {
        while i < bytes.len() && bytes[i].is_ascii_whitespace() {
            i += 1;
        }
        if i >= bytes.len() {
            break;
        }
        if bytes[i] == b'>' {
            if parts.is_empty() || pending_explicit {
                return Err(Error::UnsupportedSelector(full_selector.to_string()));
            }
            pending = SelectorCombinator::Child;
            pending_explicit = true;
            i += 1;
            continue;
        }
        let step = parse_selector_step(bytes, &mut i, full_selector)?;
        parts.push(SelectorPart {
            combinator: pending,
            step,
        });
        pending = SelectorCombinator::Descendant;
        pending_explicit = false;
    }

    if parts.is_empty() || pending_explicit {
        return Err(Error::UnsupportedSelector(full_selector.to_string()));
    }
    Ok(parts)
}

fn parse_selector_step(bytes: &[u8], i: &mut usize, full_selector: &str) -> Result<SelectorStep> {
    let mut step = SelectorStep::default();
    let mut matched_any = false;

    while *i < bytes.len() {
        let byte = bytes[*i];
        if byte == b'*' {
            step.universal = true;
            *i += 1;
            matched_any = true;
        } else if byte == b'#' {
            *i += 1;
            let name = read_ident(bytes, i);
            if name.is_empty() {
                return Err(Error::UnsupportedSelector(full_selector.to_string()));
            }
            step.id = Some(name);
            matched_any = true;
        } else if byte == b'.' {
            *i += 1;
            let name = read_ident(bytes, i);
            if name.is_empty() {
                return Err(Error::UnsupportedSelector(full_selector.to_string()));
            }
            step.classes.push(name);
            matched_any = true;
        } else if byte == b'>' || byte.is_ascii_whitespace() {
            break;
        } else if is_ident_byte(byte) {
            let name = read_ident(bytes, i);
            step.tag = Some(name.to_ascii_lowercase());
            matched_any = true;
        } else {
            return Err(Error::UnsupportedSelector(full_selector.to_string()));
        }
    }

    if !matched_any {
        return Err(Error::UnsupportedSelector(full_selector.to_string()));
    }
    Ok(step)
}

fn read_ident(bytes: &[u8], i: &mut usize) -> String {
    let start = *i;
    while *i < bytes.len() && is_ident_byte(bytes[*i]) {
        *i += 1;
    }
    String::from_utf8_lossy(&bytes[start..*i]).into_owned()
}

fn is_ident_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-' || byte == b'_'
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenerAction {
    AddClass(String),
    RemoveClass(String),
    PreventDefault,
    StopPropagation,
    StopImmediatePropagation,
}

#[derive(Debug, Clone)]
enum Action {
    User(ListenerAction),
    ScrollStyle {
        target: NodeId,
        class_name: String,
        threshold_px: i64,
    },
    ScrollStyleBySelector {
        selector: String,
        class_name: String,
        threshold_px: i64,
    },
    EnrollAlerts {
        selector: String,
        dismiss_delay_ms: i64,
    },
}

#[derive(Debug, Clone)]
struct Listener {
    id: u64,
    capture: bool,
    action: Action,
}

#[derive(Debug, Default, Clone)]
struct ListenerStore {
    map: HashMap<NodeId, HashMap<String, Vec<Listener>>>,
}

impl ListenerStore {
    fn add(&mut self, node_id: NodeId, event: String, listener: Listener) {
        self.map
            .entry(node_id)
            .or_default()
            .entry(event)
            .or_default()
            .push(listener);
    }

    fn get(&self, node_id: NodeId, event: &str, capture: bool) -> Vec<Listener> {
        self.map
            .get(&node_id)
            .and_then(|events| events.get(event))
            .map(|listeners| {
                listeners
                    .iter()
                    .filter(|listener| listener.capture == capture)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    fn remove_by_id(&mut self, id: u64) -> bool {
        let mut removed = false;
        self.map.retain(|_, events| {
            events.retain(|_, listeners| {
                let before = listeners.len();
                listeners.retain(|listener| listener.id != id);
                removed |= listeners.len() != before;
                !listeners.is_empty()
            });
            !events.is_empty()
        });
        removed
    }
}

#[derive(Debug, Clone)]
struct EventState {
    event_type: String,
    target: NodeId,
    current_target: NodeId,
    default_prevented: bool,
    propagation_stopped: bool,
    immediate_propagation_stopped: bool,
}

impl EventState {
    fn new(event_type: &str, target: NodeId) -> Self {
        Self {
            event_type: event_type.to_string(),
            target,
            current_target: target,
            default_prevented: false,
            propagation_stopped: false,
            immediate_propagation_stopped: false,
        }
    }
}

#[derive(Debug, Clone)]
struct ScheduledTask {
    id: i64,
    due_at: i64,
    order: i64,
    action: TimerAction,
}

#[derive(Debug, Clone)]
enum TimerAction {
    DismissAlert { target: NodeId },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingTimer {
    pub id: i64,
    pub due_at: i64,
    pub order: i64,
}

#[derive(Debug, Default, Clone)]
struct AlertRegistry {
    instances: HashMap<NodeId, AlertInstance>,
}

#[derive(Debug, Default, Clone)]
struct AlertInstance {
    closed: bool,
}

impl AlertRegistry {
    fn get_or_create(&mut self, element: NodeId) -> &AlertInstance {
        self.instances.entry(element).or_default()
    }

    fn mark_closed(&mut self, element: NodeId) {
        self.instances.entry(element).or_default().closed = true;
    }
}

pub const DEFAULT_NAVBAR_SELECTOR: &str = ".navbar";
pub const DEFAULT_ALERT_SELECTOR: &str = ".alert";
pub const DEFAULT_SCROLLED_CLASS: &str = "scrolled";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BehaviorConfig {
    pub threshold_px: i64,
    pub dismiss_delay_ms: i64,
}

impl Default for BehaviorConfig {
    fn default() -> Self {
        Self {
            threshold_px: 50,
            dismiss_delay_ms: 4000,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Subscription(u64);

#[derive(Debug)]
pub struct Page {
    dom: Dom,
    listeners: ListenerStore,
    alerts: AlertRegistry,
    alert_capability: bool,
    scroll_y: i64,
    ready_fired: bool,
    now_ms: i64,
    task_queue: Vec<ScheduledTask>,
    next_timer_id: i64,
    next_task_order: i64,
    next_subscription_id: u64,
    trace: bool,
    trace_events: bool,
    trace_timers: bool,
    trace_behaviors: bool,
    trace_logs: Vec<String>,
    trace_log_limit: usize,
    trace_to_stderr: bool,
}

impl Page {
    pub fn from_html(html: &str) -> Result<Self> {
        stacker::grow(32 * 1024 * 1024, || Self::from_html_impl(html))
    }

    fn from_html_impl(html: &str) -> Result<Self> {
        let dom = parse_html(html)?;
        Ok(Self {
            dom,
            listeners: ListenerStore::default(),
            alerts: AlertRegistry::default(),
            alert_capability: true,
            scroll_y: 0,
            ready_fired: false,
            now_ms: 0,
            task_queue: Vec::new(),
            next_timer_id: 1,
            next_task_order: 0,
            next_subscription_id: 1,
            trace: false,
            trace_events: true,
            trace_timers: true,
            trace_behaviors: true,
            trace_logs: Vec::new(),
            trace_log_limit: 10_000,
            trace_to_stderr: true,
        })
    }

    pub fn append_html(&mut self, selector: &str, html: &str) -> Result<()> {
        stacker::grow(32 * 1024 * 1024, || self.append_html_impl(selector, html))
    }

    fn append_html_impl(&mut self, selector: &str, html: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        let fragment = parse_html(html)?;
        let roots = fragment.nodes[fragment.root.0].children.clone();
        for node in roots {
            self.dom.graft(&fragment, node, target);
        }
        Ok(())
    }

    pub fn bind_scroll_styler(
        &mut self,
        selector: &str,
        class_name: &str,
        config: &BehaviorConfig,
    ) -> Result<Subscription> {
        let matches = self.dom.query_selector_all(selector)?;
        let target = match matches.len() {
            0 => return Err(Error::ElementNotFound(selector.to_string())),
            1 => matches[0],
            count => {
                return Err(Error::AmbiguousTarget {
                    selector: selector.to_string(),
                    matches: count,
                });
            }
        };
        let root = self.dom.root;
        let subscription = self.subscribe(
            root,
            "scroll",
            Action::ScrollStyle {
                target,
                class_name: class_name.to_string(),
                threshold_px: config.threshold_px,
            },
        );
        self.trace_behavior_line(format!(
            "[behavior] scroll_styler bound selector={selector} class={class_name} threshold={}",
            config.threshold_px
        ));
        Ok(subscription)
    }

    pub fn bind_scroll_styler_resilient(
        &mut self,
        selector: &str,
        class_name: &str,
        config: &BehaviorConfig,
    ) -> Result<Subscription> {
        parse_selector_groups(selector)?;
        let root = self.dom.root;
        let subscription = self.subscribe(
            root,
            "scroll",
            Action::ScrollStyleBySelector {
                selector: selector.to_string(),
                class_name: class_name.to_string(),
                threshold_px: config.threshold_px,
            },
        );
        self.trace_behavior_line(format!(
            "[behavior] scroll_styler bound selector={selector} class={class_name} threshold={} policy=resilient",
            config.threshold_px
        ));
        Ok(subscription)
    }

    pub fn bind_alert_auto_dismiss(
        &mut self,
        selector: &str,
        config: &BehaviorConfig,
    ) -> Result<Subscription> {
        if !self.alert_capability {
            return Err(Error::CapabilityUnavailable(
                "alert widget is not loaded".into(),
            ));
        }
        if config.dismiss_delay_ms < 0 {
            return Err(Error::PageRuntime(
                "dismiss_delay_ms must be non-negative".into(),
            ));
        }
        parse_selector_groups(selector)?;
        let root = self.dom.root;
        let subscription = self.subscribe(
            root,
            "ready",
            Action::EnrollAlerts {
                selector: selector.to_string(),
                dismiss_delay_ms: config.dismiss_delay_ms,
            },
        );
        if self.ready_fired {
            self.enroll_alerts(selector, config.dismiss_delay_ms)?;
        }
        Ok(subscription)
    }

    pub fn unbind(&mut self, subscription: Subscription) -> bool {
        self.listeners.remove_by_id(subscription.0)
    }

    pub fn add_listener(
        &mut self,
        selector: &str,
        event_type: &str,
        capture: bool,
        action: ListenerAction,
    ) -> Result<Subscription> {
        let target = self.select_one(selector)?;
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.listeners.add(
            target,
            event_type.to_string(),
            Listener {
                id,
                capture,
                action: Action::User(action),
            },
        );
        Ok(Subscription(id))
    }

    fn subscribe(&mut self, node_id: NodeId, event: &str, action: Action) -> Subscription {
        let id = self.next_subscription_id;
        self.next_subscription_id += 1;
        self.listeners.add(
            node_id,
            event.to_string(),
            Listener {
                id,
                capture: false,
                action,
            },
        );
        Subscription(id)
    }

    pub fn scroll_to(&mut self, offset_px: i64) -> Result<()> {
        if offset_px < 0 {
            return Err(Error::PageRuntime(
                "scroll_to requires a non-negative offset".into(),
            ));
        }
        self.scroll_y = offset_px;
        let root = self.dom.root;
        self.dispatch_event(root, "scroll")?;
        Ok(())
    }

    pub fn scroll_y(&self) -> i64 {
        self.scroll_y
    }

    pub fn document_ready(&mut self) -> Result<()> {
        if self.ready_fired {
            return Err(Error::PageRuntime("document_ready already fired".into()));
        }
        self.ready_fired = true;
        let root = self.dom.root;
        self.dispatch_event(root, "ready")?;
        Ok(())
    }

    pub fn is_ready(&self) -> bool {
        self.ready_fired
    }

    pub fn dispatch(&mut self, selector: &str, event_type: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.dispatch_event(target, event_type)?;
        Ok(())
    }

    pub fn close_alert(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.close_alert_node(target)
    }

    pub fn remove(&mut self, selector: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        self.dom.detach(target)
    }

    pub fn set_alert_capability(&mut self, loaded: bool) {
        self.alert_capability = loaded;
    }

    pub fn alert_capability(&self) -> bool {
        self.alert_capability
    }

    fn enroll_alerts(&mut self, selector: &str, dismiss_delay_ms: i64) -> Result<()> {
        let targets = self.dom.query_selector_all(selector)?;
        let enrolled = targets.len();
        for target in targets {
            self.schedule_dismiss(target, dismiss_delay_ms);
        }
        self.trace_behavior_line(format!(
            "[behavior] alert_auto_dismiss selector={selector} enrolled={enrolled} delay_ms={dismiss_delay_ms}"
        ));
        Ok(())
    }

    fn schedule_dismiss(&mut self, target: NodeId, delay_ms: i64) -> i64 {
        let id = self.next_timer_id;
        self.next_timer_id += 1;
        let order = self.next_task_order;
        self.next_task_order += 1;
        let due_at = self.now_ms.saturating_add(delay_ms);
        self.task_queue.push(ScheduledTask {
            id,
            due_at,
            order,
            action: TimerAction::DismissAlert { target },
        });
        self.trace_timer_line(format!(
            "[timer] schedule id={id} due_at={due_at} action=dismiss_alert"
        ));
        id
    }

    fn close_alert_node(&mut self, target: NodeId) -> Result<()> {
        if !self.alert_capability {
            return Err(Error::CapabilityUnavailable(
                "alert widget is not loaded".into(),
            ));
        }
        let label = self.trace_node_label(target);
        if self.alerts.get_or_create(target).closed {
            self.trace_behavior_line(format!(
                "[alert] close target={label} outcome=already_closed"
            ));
            return Ok(());
        }
        if !self.dom.is_attached(target) {
            self.alerts.mark_closed(target);
            self.trace_behavior_line(format!("[alert] close target={label} outcome=stale"));
            return Ok(());
        }
        let event = self.dispatch_event(target, "close")?;
        if event.default_prevented {
            self.trace_behavior_line(format!("[alert] close target={label} outcome=prevented"));
            return Ok(());
        }
        self.dom.detach(target)?;
        self.alerts.mark_closed(target);
        self.dispatch_event(target, "closed")?;
        self.trace_behavior_line(format!("[alert] close target={label} outcome=closed"));
        Ok(())
    }

    fn dispatch_event(&mut self, target: NodeId, event_type: &str) -> Result<EventState> {
        stacker::grow(32 * 1024 * 1024, || {
            self.dispatch_event_impl(target, event_type)
        })
    }

    fn dispatch_event_impl(&mut self, target: NodeId, event_type: &str) -> Result<EventState> {
        let mut event = EventState::new(event_type, target);

        let mut path = Vec::new();
        let mut cursor = Some(target);
        while let Some(node) = cursor {
            path.push(node);
            cursor = self.dom.parent(node);
        }
        path.reverse();

        if path.is_empty() {
            self.trace_event_done(&event, "empty_path");
            return Ok(event);
        }

        // Capture phase.
        if path.len() >= 2 {
            for node in &path[..path.len() - 1] {
                event.current_target = *node;
                self.invoke_listeners(*node, &mut event, true)?;
                if event.propagation_stopped {
                    self.trace_event_done(&event, "propagation_stopped");
                    return Ok(event);
                }
            }
        }

        // Target phase: capture listeners first.
        event.current_target = target;
        self.invoke_listeners(target, &mut event, true)?;
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return Ok(event);
        }

        // Target phase: bubble listeners.
        self.invoke_listeners(target, &mut event, false)?;
        if event.propagation_stopped {
            self.trace_event_done(&event, "propagation_stopped");
            return Ok(event);
        }

        // Bubble phase.
        if path.len() >= 2 {
            for node in path[..path.len() - 1].iter().rev() {
                event.current_target = *node;
                self.invoke_listeners(*node, &mut event, false)?;
                if event.propagation_stopped {
                    self.trace_event_done(&event, "propagation_stopped");
                    return Ok(event);
                }
            }
        }

        self.trace_event_done(&event, "completed");
        Ok(event)
    }

    fn invoke_listeners(
        &mut self,
        node_id: NodeId,
        event: &mut EventState,
        capture: bool,
    ) -> Result<()> {
        let listeners = self.listeners.get(node_id, &event.event_type, capture);
        for listener in listeners {
            if self.trace {
                let phase = if capture { "capture" } else { "bubble" };
                let target_label = self.trace_node_label(event.target);
                let current_label = self.trace_node_label(event.current_target);
                self.trace_event_line(format!(
                    "[event] {} target={} current={} phase={} default_prevented={}",
                    event.event_type, target_label, current_label, phase, event.default_prevented
                ));
            }
            self.execute_action(&listener.action, event)?;
            if event.immediate_propagation_stopped {
                break;
            }
        }
        Ok(())
    }

    fn execute_action(&mut self, action: &Action, event: &mut EventState) -> Result<()> {
        match action {
            Action::User(user_action) => match user_action {
                ListenerAction::AddClass(class_name) => {
                    self.dom.class_add(event.current_target, class_name)
                }
                ListenerAction::RemoveClass(class_name) => {
                    self.dom.class_remove(event.current_target, class_name)
                }
                ListenerAction::PreventDefault => {
                    event.default_prevented = true;
                    Ok(())
                }
                ListenerAction::StopPropagation => {
                    event.propagation_stopped = true;
                    Ok(())
                }
                ListenerAction::StopImmediatePropagation => {
                    event.propagation_stopped = true;
                    event.immediate_propagation_stopped = true;
                    Ok(())
                }
            },
            Action::ScrollStyle {
                target,
                class_name,
                threshold_px,
            } => self.apply_scroll_style(*target, class_name, *threshold_px),
            Action::ScrollStyleBySelector {
                selector,
                class_name,
                threshold_px,
            } => match self.dom.query_selector(selector)? {
                Some(target) => self.apply_scroll_style(target, class_name, *threshold_px),
                None => {
                    self.trace_behavior_line(format!(
                        "[behavior] scroll_styler skip selector={selector} reason=no_match"
                    ));
                    Ok(())
                }
            },
            Action::EnrollAlerts {
                selector,
                dismiss_delay_ms,
            } => {
                let selector = selector.clone();
                self.enroll_alerts(&selector, *dismiss_delay_ms)
            }
        }
    }

    fn apply_scroll_style(
        &mut self,
        target: NodeId,
        class_name: &str,
        threshold_px: i64,
    ) -> Result<()> {
        let styled = self.scroll_y > threshold_px;
        if styled {
            self.dom.class_add(target, class_name)?;
        } else {
            self.dom.class_remove(target, class_name)?;
        }
        self.trace_behavior_line(format!(
            "[behavior] scroll_styler offset={} threshold={threshold_px} class={class_name} styled={styled}",
            self.scroll_y
        ));
        Ok(())
    }

    pub fn now_ms(&self) -> i64 {
        self.now_ms
    }

    pub fn advance_time(&mut self, delta_ms: i64) -> Result<()> {
        if delta_ms < 0 {
            return Err(Error::PageRuntime(
                "advance_time requires non-negative milliseconds".into(),
            ));
        }
        let from = self.now_ms;
        self.now_ms = self.now_ms.saturating_add(delta_ms);
        let ran = self.run_due_timers_internal()?;
        self.trace_timer_line(format!(
            "[timer] advance delta_ms={} from={} to={} ran_due={}",
            delta_ms, from, self.now_ms, ran
        ));
        Ok(())
    }

    pub fn advance_time_to(&mut self, target_ms: i64) -> Result<()> {
        if target_ms < self.now_ms {
            return Err(Error::PageRuntime(format!(
                "advance_time_to requires target >= now_ms (target={target_ms}, now_ms={})",
                self.now_ms
            )));
        }
        let from = self.now_ms;
        self.now_ms = target_ms;
        let ran = self.run_due_timers_internal()?;
        self.trace_timer_line(format!(
            "[timer] advance_to from={} to={} ran_due={}",
            from, self.now_ms, ran
        ));
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        let from = self.now_ms;
        let ran = self.run_timer_queue(None, true)?;
        self.trace_timer_line(format!(
            "[timer] flush from={} to={} ran={}",
            from, self.now_ms, ran
        ));
        Ok(())
    }

    pub fn run_next_timer(&mut self) -> Result<bool> {
        let Some(next_index) = self.next_task_index(None) else {
            self.trace_timer_line("[timer] run_next none".into());
            return Ok(false);
        };

        let task = self.task_queue.remove(next_index);
        if task.due_at > self.now_ms {
            self.now_ms = task.due_at;
        }
        self.execute_timer_task(task)?;
        Ok(true)
    }

    pub fn run_due_timers(&mut self) -> Result<usize> {
        let ran = self.run_due_timers_internal()?;
        self.trace_timer_line(format!(
            "[timer] run_due now_ms={} ran={}",
            self.now_ms, ran
        ));
        Ok(ran)
    }

    fn run_due_timers_internal(&mut self) -> Result<usize> {
        self.run_timer_queue(Some(self.now_ms), false)
    }

    fn run_timer_queue(&mut self, due_limit: Option<i64>, advance_clock: bool) -> Result<usize> {
        let mut ran = 0usize;
        while let Some(next_index) = self.next_task_index(due_limit) {
            ran += 1;
            let task = self.task_queue.remove(next_index);
            if advance_clock && task.due_at > self.now_ms {
                self.now_ms = task.due_at;
            }
            self.execute_timer_task(task)?;
        }
        Ok(ran)
    }

    fn next_task_index(&self, due_limit: Option<i64>) -> Option<usize> {
        self.task_queue
            .iter()
            .enumerate()
            .filter(|(_, task)| due_limit.is_none_or(|limit| task.due_at <= limit))
            .min_by_key(|(_, task)| (task.due_at, task.order))
            .map(|(index, _)| index)
    }

    fn execute_timer_task(&mut self, task: ScheduledTask) -> Result<()> {
        stacker::grow(32 * 1024 * 1024, || self.execute_timer_task_impl(task))
    }

    fn execute_timer_task_impl(&mut self, task: ScheduledTask) -> Result<()> {
        match task.action {
            TimerAction::DismissAlert { target } => {
                self.trace_timer_line(format!("[timer] run id={} action=dismiss_alert", task.id));
                self.close_alert_node(target)
            }
        }
    }

    pub fn pending_timers(&self) -> Vec<PendingTimer> {
        let mut timers = self
            .task_queue
            .iter()
            .map(|task| PendingTimer {
                id: task.id,
                due_at: task.due_at,
                order: task.order,
            })
            .collect::<Vec<_>>();
        timers.sort_by_key(|timer| (timer.due_at, timer.order));
        timers
    }

    pub fn clear_timer(&mut self, timer_id: i64) -> bool {
        let before = self.task_queue.len();
        self.task_queue.retain(|task| task.id != timer_id);
        let cleared = self.task_queue.len() != before;
        if cleared {
            self.trace_timer_line(format!("[timer] clear id={timer_id}"));
        }
        cleared
    }

    pub fn clear_all_timers(&mut self) -> usize {
        let cleared = self.task_queue.len();
        self.task_queue.clear();
        self.trace_timer_line(format!("[timer] clear_all cleared={cleared}"));
        cleared
    }

    pub fn enable_trace(&mut self, enabled: bool) {
        self.trace = enabled;
    }

    pub fn take_trace_logs(&mut self) -> Vec<String> {
        std::mem::take(&mut self.trace_logs)
    }

    pub fn set_trace_stderr(&mut self, enabled: bool) {
        self.trace_to_stderr = enabled;
    }

    pub fn set_trace_events(&mut self, enabled: bool) {
        self.trace_events = enabled;
    }

    pub fn set_trace_timers(&mut self, enabled: bool) {
        self.trace_timers = enabled;
    }

    pub fn set_trace_behaviors(&mut self, enabled: bool) {
        self.trace_behaviors = enabled;
    }

    pub fn set_trace_log_limit(&mut self, max_entries: usize) -> Result<()> {
        if max_entries == 0 {
            return Err(Error::PageRuntime(
                "set_trace_log_limit requires at least 1 entry".into(),
            ));
        }
        self.trace_log_limit = max_entries;
        while self.trace_logs.len() > self.trace_log_limit {
            self.trace_logs.remove(0);
        }
        Ok(())
    }

    fn trace_event_done(&mut self, event: &EventState, outcome: &str) {
        if !self.trace {
            return;
        }
        let target_label = self.trace_node_label(event.target);
        let current_label = self.trace_node_label(event.current_target);
        self.trace_event_line(format!(
            "[event] done {} target={} current={} outcome={} default_prevented={} propagation_stopped={}",
            event.event_type,
            target_label,
            current_label,
            outcome,
            event.default_prevented,
            event.propagation_stopped
        ));
    }

    fn trace_event_line(&mut self, line: String) {
        if self.trace && self.trace_events {
            self.trace_line(line);
        }
    }

    fn trace_timer_line(&mut self, line: String) {
        if self.trace && self.trace_timers {
            self.trace_line(line);
        }
    }

    fn trace_behavior_line(&mut self, line: String) {
        if self.trace && self.trace_behaviors {
            self.trace_line(line);
        }
    }

    fn trace_line(&mut self, line: String) {
        if self.trace {
            if self.trace_to_stderr {
                eprintln!("{line}");
            }
            if self.trace_logs.len() >= self.trace_log_limit {
                self.trace_logs.remove(0);
            }
            self.trace_logs.push(line);
        }
    }

    fn trace_node_label(&self, node_id: NodeId) -> String {
        match &self.dom.nodes[node_id.0].node_type {
            NodeType::Document => "#document".to_string(),
            NodeType::Text(_) => "#text".to_string(),
            NodeType::Element(element) => match element.attrs.get("id") {
                Some(id) => format!("{}#{id}", element.tag_name),
                None => element.tag_name.clone(),
            },
        }
    }

    pub fn assert_exists(&self, selector: &str) -> Result<()> {
        let _ = self.select_one(selector)?;
        Ok(())
    }

    pub fn assert_absent(&self, selector: &str) -> Result<()> {
        let matches = self.dom.query_selector_all(selector)?;
        if let Some(first) = matches.first() {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: "no matching element".into(),
                actual: format!("{} matching", matches.len()),
                dom_snippet: self.node_snippet(*first),
            });
        }
        Ok(())
    }

    pub fn assert_has_class(&self, selector: &str, class_name: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if !self.dom.class_contains(target, class_name)? {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: format!("class '{class_name}' present"),
                actual: "absent".into(),
                dom_snippet: self.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn assert_not_has_class(&self, selector: &str, class_name: &str) -> Result<()> {
        let target = self.select_one(selector)?;
        if self.dom.class_contains(target, class_name)? {
            return Err(Error::AssertionFailed {
                selector: selector.to_string(),
                expected: format!("class '{class_name}' absent"),
                actual: "present".into(),
                dom_snippet: self.node_snippet(target),
            });
        }
        Ok(())
    }

    pub fn has_class(&self, selector: &str, class_name: &str) -> Result<bool> {
        let target = self.select_one(selector)?;
        self.dom.class_contains(target, class_name)
    }

    pub fn count(&self, selector: &str) -> Result<usize> {
        Ok(self.dom.query_selector_all(selector)?.len())
    }

    pub fn dump_dom(&self, selector: &str) -> Result<String> {
        let target = self.select_one(selector)?;
        Ok(self.dom.dump_node(target))
    }

    fn select_one(&self, selector: &str) -> Result<NodeId> {
        self.dom
            .query_selector(selector)?
            .ok_or_else(|| Error::ElementNotFound(selector.to_string()))
    }

    fn node_snippet(&self, node_id: NodeId) -> String {
        truncate_chars(&self.dom.dump_node(node_id), 200)
    }
}

fn parse_html(html: &str) -> Result<Dom> {
    let mut dom = Dom::new();
    let mut stack = vec![dom.root];
    let bytes = html.as_bytes();
    let mut i = 0usize;

    while i < bytes.len() {
        if starts_with_at(bytes, i, b"<!--") {
            match find_subslice(bytes, i + 4, b"-->") {
                Some(end) => {
                    i = end + 3;
                }
                None => return Err(Error::HtmlParse("unclosed HTML comment".into())),
            }
            continue;
        }

        if starts_with_at(bytes, i, b"<!") {
            match find_subslice(bytes, i, b">") {
                Some(end) => {
                    i = end + 1;
                }
                None => return Err(Error::HtmlParse("unclosed markup declaration".into())),
            }
            continue;
        }

        if bytes[i] == b'<' {
            if starts_with_at(bytes, i, b"</") {
                let (tag, next) = parse_end_tag(html, i)?;
                i = next;

                while stack.len() > 1 {
                    let top = *stack
                        .last()
                        .ok_or_else(|| Error::HtmlParse("invalid stack state".into()))?;
                    let top_tag = dom.tag_name(top).unwrap_or("").to_string();
                    stack.pop();
                    if top_tag.eq_ignore_ascii_case(&tag) {
                        break;
                    }
                }
                continue;
            }

            let (tag, attrs, self_closing, next) = parse_start_tag(html, i)?;
            i = next;

            let parent = *stack
                .last()
                .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
            let node = dom.create_element(parent, tag.clone(), attrs);

            if tag.eq_ignore_ascii_case("script") || tag.eq_ignore_ascii_case("style") {
                let close = find_case_insensitive_end_tag(bytes, i, tag.as_bytes())
                    .ok_or_else(|| Error::HtmlParse(format!("unclosed <{tag}>")))?;
                if let Some(raw) = html.get(i..close) {
                    if !raw.is_empty() {
                        dom.create_text(node, raw.to_string());
                    }
                }
                i = close;
                let (_, after_end) = parse_end_tag(html, i)?;
                i = after_end;
                continue;
            }

            if !self_closing && !is_void_tag(&tag) {
                stack.push(node);
            }
            continue;
        }

        let text_start = i;
        while i < bytes.len() && bytes[i] != b'<' {
            i += 1;
        }

        if let Some(text) = html.get(text_start..i) {
            if !text.is_empty() {
                let parent = *stack
                    .last()
                    .ok_or_else(|| Error::HtmlParse("missing parent element".into()))?;
                dom.create_text(parent, text.to_string());
            }
        }
    }

    Ok(dom)
}

fn parse_start_tag(
    html: &str,
    at: usize,
) -> Result<(String, HashMap<String, String>, bool, usize)> {
    let bytes = html.as_bytes();
    let mut i = at;
    if bytes.get(i) != Some(&b'<') {
        return Err(Error::HtmlParse("expected '<'".into()));
    }
    i += 1;

    skip_ws(bytes, &mut i);
    let tag_start = i;
    while i < bytes.len() && is_tag_byte(bytes[i]) {
        i += 1;
    }

    let tag = html
        .get(tag_start..i)
        .ok_or_else(|| Error::HtmlParse("invalid tag name".into()))?
        .to_ascii_lowercase();

    if tag.is_empty() {
        return Err(Error::HtmlParse("empty tag name".into()));
    }

    let mut attrs = HashMap::new();
    let mut self_closing = false;

    loop {
        skip_ws(bytes, &mut i);
        if i >= bytes.len() {
            return Err(Error::HtmlParse("unclosed start tag".into()));
        }

        if bytes[i] == b'>' {
            i += 1;
            break;
        }

        if bytes[i] == b'/' && bytes.get(i + 1) == Some(&b'>') {
            self_closing = true;
            i += 2;
            break;
        }

        let name_start = i;
        while i < bytes.len()
            && !bytes[i].is_ascii_whitespace()
            && bytes[i] != b'='
            && bytes[i] != b'>'
            && bytes[i] != b'/'
        {
            i += 1;
        }
        let name = html
            .get(name_start..i)
            .ok_or_else(|| Error::HtmlParse("invalid attribute name".into()))?
            .to_ascii_lowercase();
        if name.is_empty() {
            return Err(Error::HtmlParse("invalid attribute name".into()));
        }

        skip_ws(bytes, &mut i);
        let value = if bytes.get(i) == Some(&b'=') {
            i += 1;
            skip_ws(bytes, &mut i);
            match bytes.get(i) {
                Some(&quote) if quote == b'"' || quote == b'\'' => {
                    i += 1;
                    let value_start = i;
                    while i < bytes.len() && bytes[i] != quote {
                        i += 1;
                    }
                    if i >= bytes.len() {
                        return Err(Error::HtmlParse(format!(
                            "unclosed attribute value: {name}"
                        )));
                    }
                    let value = html
                        .get(value_start..i)
                        .ok_or_else(|| Error::HtmlParse("invalid attribute value".into()))?
                        .to_string();
                    i += 1;
                    value
                }
                _ => {
                    let value_start = i;
                    while i < bytes.len() && !bytes[i].is_ascii_whitespace() && bytes[i] != b'>' {
                        i += 1;
                    }
                    html.get(value_start..i)
                        .ok_or_else(|| Error::HtmlParse("invalid attribute value".into()))?
                        .to_string()
                }
            }
        } else {
            String::new()
        };

        attrs.insert(name, value);
    }

    Ok((tag, attrs, self_closing, i))
}

fn parse_end_tag(html: &str, at: usize) -> Result<(String, usize)> {
    let bytes = html.as_bytes();
    let mut i = at;
    if !starts_with_at(bytes, i, b"</") {
        return Err(Error::HtmlParse("expected end tag".into()));
    }
    i += 2;
    skip_ws(bytes, &mut i);
    let tag_start = i;
    while i < bytes.len() && is_tag_byte(bytes[i]) {
        i += 1;
    }
    let tag = html
        .get(tag_start..i)
        .ok_or_else(|| Error::HtmlParse("invalid end tag".into()))?
        .to_ascii_lowercase();
    if tag.is_empty() {
        return Err(Error::HtmlParse("empty end tag".into()));
    }
    skip_ws(bytes, &mut i);
    if bytes.get(i) != Some(&b'>') {
        return Err(Error::HtmlParse(format!("unclosed end tag: {tag}")));
    }
    Ok((tag, i + 1))
}

fn find_case_insensitive_end_tag(bytes: &[u8], from: usize, tag: &[u8]) -> Option<usize> {
    let mut i = from;
    while i + tag.len() + 2 <= bytes.len() {
        if bytes[i] == b'<' && bytes.get(i + 1) == Some(&b'/') {
            let start = i + 2;
            let end = start + tag.len();
            if end <= bytes.len() && bytes[start..end].eq_ignore_ascii_case(tag) {
                return Some(i);
            }
        }
        i += 1;
    }
    None
}

fn skip_ws(bytes: &[u8], i: &mut usize) {
    while *i < bytes.len() && bytes[*i].is_ascii_whitespace() {
        *i += 1;
    }
}

fn is_tag_byte(byte: u8) -> bool {
    byte.is_ascii_alphanumeric() || byte == b'-'
}

fn is_void_tag(tag: &str) -> bool {
    matches!(
        tag,
        "area"
            | "base"
            | "br"
            | "col"
            | "embed"
            | "hr"
            | "img"
            | "input"
            | "link"
            | "meta"
            | "source"
            | "track"
            | "wbr"
    )
}

fn starts_with_at(bytes: &[u8], at: usize, needle: &[u8]) -> bool {
    bytes.len() >= at + needle.len() && &bytes[at..at + needle.len()] == needle
}

fn find_subslice(bytes: &[u8], from: usize, needle: &[u8]) -> Option<usize> {
    if needle.is_empty() || bytes.len() < needle.len() || from > bytes.len() - needle.len() {
        return None;
    }
    (from..=bytes.len() - needle.len()).find(|&at| &bytes[at..at + needle.len()] == needle)
}

fn truncate_chars(value: &str, max_chars: usize) -> String {
    if value.chars().count() <= max_chars {
        value.to_string()
    } else {
        value.chars().take(max_chars).collect()
    }
}
