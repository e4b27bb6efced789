//! A minimal document tree: just enough structure for the intro to find its
//! elements, walk their children and set attributes.

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Node {
    Element(Element),
    Text(String),
}

impl Node {
    pub fn as_element(&self) -> Option<&Element> {
        match self {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        }
    }

    pub fn as_element_mut(&mut self) -> Option<&mut Element> {
        match self {
            Node::Element(element) => Some(element),
            Node::Text(_) => None,
        }
    }
}

impl From<Element> for Node {
    fn from(element: Element) -> Self {
        Node::Element(element)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Element {
    pub tag: String,
    /// In source order.
    pub attributes: Vec<(String, String)>,
    pub children: Vec<Node>,
}

impl Element {
    pub fn new(tag: impl Into<String>) -> Self {
        Self {
            tag: tag.into(),
            ..Self::default()
        }
    }

    pub fn attr(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.set_attribute(name, value);
        self
    }

    pub fn child(mut self, child: impl Into<Node>) -> Self {
        self.children.push(child.into());
        self
    }

    pub fn text(mut self, text: impl Into<String>) -> Self {
        self.children.push(Node::Text(text.into()));
        self
    }

    pub fn get_attribute(&self, name: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|(key, _)| key == name)
            .map(|(_, value)| value.as_str())
    }

    /// Replaces the value of an existing attribute, or appends a new one.
    pub fn set_attribute(&mut self, name: impl Into<String>, value: impl Into<String>) {
        let name = name.into();
        let value = value.into();

        match self.attributes.iter_mut().find(|(key, _)| *key == name) {
            Some((_, old)) => *old = value,
            None => self.attributes.push((name, value)),
        }
    }

    pub fn has_class(&self, class: &str) -> bool {
        self.get_attribute("class")
            .is_some_and(|list| list.split_ascii_whitespace().any(|c| c == class))
    }

    /// Direct children that are elements, in document order.
    pub fn element_children(&self) -> impl Iterator<Item = &Element> {
        self.children.iter().filter_map(Node::as_element)
    }

    pub fn element_children_mut(&mut self) -> impl Iterator<Item = &mut Element> {
        self.children.iter_mut().filter_map(Node::as_element_mut)
    }

    fn matches(&self, selector: &Selector<'_>) -> bool {
        match selector {
            Selector::Class(class) => self.has_class(class),
            Selector::Id(id) => self.get_attribute("id") == Some(*id),
            Selector::Tag(tag) => self.tag.eq_ignore_ascii_case(tag),
        }
    }
}

/// The supported subset of CSS selectors: a single `.class`, `#id` or tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Selector<'a> {
    Class(&'a str),
    Id(&'a str),
    Tag(&'a str),
}

impl<'a> Selector<'a> {
    fn parse(selector: &'a str) -> Self {
        let selector = selector.trim();
        if let Some(class) = selector.strip_prefix('.') {
            Selector::Class(class)
        } else if let Some(id) = selector.strip_prefix('#') {
            Selector::Id(id)
        } else {
            Selector::Tag(selector)
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Document {
    pub root: Element,
}

impl Document {
    pub fn new(root: Element) -> Self {
        Self { root }
    }

    /// First element in document order matching `selector`.
    pub fn query_selector(&self, selector: &str) -> Option<&Element> {
        let path = self.find(&Selector::parse(selector))?;
        let mut element = &self.root;
        for i in path {
            element = element.children[i].as_element()?;
        }
        Some(element)
    }

    pub fn query_selector_mut(&mut self, selector: &str) -> Option<&mut Element> {
        let path = self.find(&Selector::parse(selector))?;
        let mut element = &mut self.root;
        for i in path {
            element = element.children[i].as_element_mut()?;
        }
        Some(element)
    }

    /// Child index path from the root to the first match, depth first.
    fn find(&self, selector: &Selector<'_>) -> Option<Vec<usize>> {
        fn walk(element: &Element, selector: &Selector<'_>, path: &mut Vec<usize>) -> bool {
            if element.matches(selector) {
                return true;
            }

            for (i, child) in element.children.iter().enumerate() {
                if let Some(child) = child.as_element() {
                    path.push(i);
                    if walk(child, selector, path) {
                        return true;
                    }
                    path.pop();
                }
            }

            false
        }

        let mut path = Vec::new();
        walk(&self.root, selector, &mut path).then_some(path)
    }
}
