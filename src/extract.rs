//! Test method discovery from decoded DEX images.
//!
//! Two frameworks are recognised:
//!
//! - **JUnit4**: methods annotated `@org.junit.Test`, declared on the class or
//!   inherited from a superclass in the same binary.
//! - **JUnit3**: public, non-static `void test*()` methods of classes that
//!   extend `junit.framework.TestCase`, directly or through one of the
//!   `android.test` base classes.
//!
//! Classes run by a parameterized runner (`@RunWith(Parameterized.class)`,
//! `@RunWith(JUnitParamsRunner.class)`) are collected separately. Their cases
//! only exist at run time, so they are scheduled as one atomic unit.

use std::collections::{HashMap, HashSet};
use std::path::Path;

use tracing::debug;

use crate::dex::{
    Annotation, ClassDef, DexError, DexFile, DexResult, MethodDef, read_dex_files_until,
};
use crate::filter::{TestCandidate, TestFilter};
use crate::shard::SchedulableTest;

/// Annotation marking a JUnit4 test method.
pub const TEST_ANNOTATION: &str = "org.junit.Test";

/// Base class of JUnit3 test cases.
pub const JUNIT3_TEST_CASE: &str = "junit.framework.TestCase";

/// Platform subclasses of [`JUNIT3_TEST_CASE`]. They ship with the device
/// runner, not the test binary, so the superclass walk ends at them.
pub const ANDROID_JUNIT3_BASES: [&str; 11] = [
    "android.test.AndroidTestCase",
    "android.test.InstrumentationTestCase",
    "android.test.ActivityInstrumentationTestCase",
    "android.test.ActivityInstrumentationTestCase2",
    "android.test.ActivityTestCase",
    "android.test.ActivityUnitTestCase",
    "android.test.ApplicationTestCase",
    "android.test.LoaderTestCase",
    "android.test.ProviderTestCase",
    "android.test.ProviderTestCase2",
    "android.test.ServiceTestCase",
];

fn is_junit3_root(name: &str) -> bool {
    name == JUNIT3_TEST_CASE || ANDROID_JUNIT3_BASES.contains(&name)
}

/// Runner names that make a class parameterized, matched case-insensitively
/// as substrings of the runner type.
pub const PARAMETERIZED_RUNNERS: [&str; 2] = ["JUnitParamsRunner", "Parameterized"];

/// Annotations that route a test to the ignored list.
pub const IGNORE_ANNOTATIONS: [&str; 3] = [
    "org.junit.Ignore",
    "androidx.test.filters.Suppress",
    "android.support.test.filters.Suppress",
];

/// A test method as declared in the binary.
#[derive(Debug, Clone, PartialEq)]
pub struct TestMethod {
    pub class_name: String,
    pub method_name: String,
    /// Method annotations followed by the effective class annotations.
    pub annotations: Vec<Annotation>,
}

impl TestMethod {
    /// Qualified name, `com.example.LoginTest#testLogin`.
    pub fn test_name(&self) -> String {
        format!("{}#{}", self.class_name, self.method_name)
    }

    pub fn is_ignored(&self) -> bool {
        self.annotations
            .iter()
            .any(|a| IGNORE_ANNOTATIONS.contains(&a.name.as_str()))
    }

    fn candidate(&self) -> TestCandidate<'_> {
        TestCandidate {
            class_name: &self.class_name,
            method_name: Some(&self.method_name),
            annotations: &self.annotations,
        }
    }
}

/// A class whose tests are generated at run time by a parameterized runner.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterizedClass {
    pub name: String,
    /// Effective class annotations.
    pub annotations: Vec<Annotation>,
}

impl ParameterizedClass {
    fn candidate(&self) -> TestCandidate<'_> {
        TestCandidate {
            class_name: &self.name,
            method_name: None,
            annotations: &self.annotations,
        }
    }
}

/// Everything discovered in one test binary.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedTests {
    /// Every declared test method, in discovery order. May contain
    /// duplicates and methods of parameterized classes.
    pub methods: Vec<TestMethod>,
    pub parameterized: Vec<ParameterizedClass>,
}

/// Reads a test binary and discovers its tests.
///
/// # Errors
///
/// Any read or decoding failure is returned as-is; a corrupt binary never
/// yields a partial result.
pub fn extract_tests(path: &Path) -> DexResult<ExtractedTests> {
    extract_tests_until(path, || false)
}

/// Like [`extract_tests`], but gives up with [`DexError::Cancelled`] between
/// DEX images once `cancelled` returns `true`.
pub fn extract_tests_until(
    path: &Path,
    cancelled: impl Fn() -> bool,
) -> DexResult<ExtractedTests> {
    let files = read_dex_files_until(path, &cancelled)?;
    if cancelled() {
        return Err(DexError::Cancelled);
    }
    let extracted = ExtractedTests::from_dex_files(&files);
    debug!(
        "Found {} test methods and {} parameterized classes in {}",
        extracted.methods.len(),
        extracted.parameterized.len(),
        path.display()
    );
    Ok(extracted)
}

impl ExtractedTests {
    pub fn from_dex_files(files: &[DexFile]) -> Self {
        let hierarchy = ClassHierarchy::new(files);
        let mut extracted = Self::default();
        let mut parameterized_seen = HashSet::new();

        for class in files.iter().flat_map(|f| &f.classes) {
            if !class.is_concrete() {
                continue;
            }

            let lineage = hierarchy.lineage(class);
            let class_annotations = effective_annotations(&lineage);

            if is_parameterized(&class_annotations)
                && parameterized_seen.insert(class.name.as_str())
            {
                extracted.parameterized.push(ParameterizedClass {
                    name: class.name.clone(),
                    annotations: class_annotations.clone(),
                });
            }

            let junit3 = hierarchy.extends(class, is_junit3_root);
            for method in lineage.iter().flat_map(|c| &c.methods) {
                if !is_test_method(method, junit3) {
                    continue;
                }
                let mut annotations = method.annotations.clone();
                for annotation in &class_annotations {
                    if !annotations.iter().any(|a| a.name == annotation.name) {
                        annotations.push(annotation.clone());
                    }
                }
                extracted.methods.push(TestMethod {
                    class_name: class.name.clone(),
                    method_name: method.name.clone(),
                    annotations,
                });
            }
        }

        extracted
    }

    /// Produces the schedulable entries for this binary.
    ///
    /// Methods are deduplicated by qualified name (first occurrence wins) and
    /// filtered. Methods of parameterized classes are replaced by one entry
    /// per class, appended after the ordinary methods.
    pub fn schedulable(&self, filter: &TestFilter) -> Vec<SchedulableTest> {
        let parameterized: HashSet<&str> =
            self.parameterized.iter().map(|p| p.name.as_str()).collect();
        let mut seen = HashSet::new();

        let methods = self
            .methods
            .iter()
            .filter(|m| seen.insert(m.test_name()))
            .filter(|m| !parameterized.contains(m.class_name.as_str()))
            .filter(|m| filter.should_run(&m.candidate()))
            .map(|m| SchedulableTest::method(&m.class_name, &m.method_name, m.is_ignored()));

        let classes = self
            .parameterized
            .iter()
            .filter(|p| filter.should_run(&p.candidate()))
            .map(|p| SchedulableTest::parameterized_class(&p.name));

        methods.chain(classes).collect()
    }
}

fn is_test_method(method: &MethodDef, junit3: bool) -> bool {
    if method.is_constructor() {
        return false;
    }
    method.has_annotation(TEST_ANNOTATION)
        || (junit3
            && method.is_public()
            && !method.is_static()
            && method.name.starts_with("test")
            && method.parameters.is_empty()
            && method.return_type == "V")
}

/// Class annotations of a lineage, nearest first, one per annotation type.
fn effective_annotations(lineage: &[&ClassDef]) -> Vec<Annotation> {
    let mut seen = HashSet::new();
    lineage
        .iter()
        .flat_map(|c| &c.annotations)
        .filter(|a| seen.insert(a.name.as_str()))
        .cloned()
        .collect()
}

/// Checks the nearest `@RunWith`-style annotation against the runner list.
fn is_parameterized(class_annotations: &[Annotation]) -> bool {
    let Some(run_with) = class_annotations
        .iter()
        .find(|a| a.name.to_ascii_lowercase().contains("runwith"))
    else {
        return false;
    };
    run_with.type_values().any(|runner| {
        let runner = runner.to_ascii_lowercase();
        PARAMETERIZED_RUNNERS
            .iter()
            .any(|name| runner.contains(&name.to_ascii_lowercase()))
    })
}

/// Superclass lookup across all DEX images of a binary.
struct ClassHierarchy<'a> {
    classes: HashMap<&'a str, &'a ClassDef>,
}

impl<'a> ClassHierarchy<'a> {
    fn new(files: &'a [DexFile]) -> Self {
        let mut classes = HashMap::new();
        for class in files.iter().flat_map(|f| &f.classes) {
            classes.entry(class.name.as_str()).or_insert(class);
        }
        Self { classes }
    }

    /// The class followed by its ancestors that are defined in the binary.
    fn lineage(&self, class: &'a ClassDef) -> Vec<&'a ClassDef> {
        let mut lineage = vec![class];
        let mut visited = HashSet::from([class.name.as_str()]);
        let mut current = class;
        while let Some(next) = current
            .superclass
            .as_deref()
            .and_then(|name| self.classes.get(name))
        {
            if !visited.insert(next.name.as_str()) {
                break;
            }
            lineage.push(next);
            current = next;
        }
        lineage
    }

    /// Returns `true` if a superclass satisfying `is_root` appears anywhere in
    /// the chain, including as the first superclass not defined in the binary.
    fn extends(&self, class: &ClassDef, is_root: impl Fn(&str) -> bool) -> bool {
        let mut visited = HashSet::new();
        let mut current = class;
        loop {
            let Some(superclass) = current.superclass.as_deref() else {
                return false;
            };
            if is_root(superclass) {
                return true;
            }
            match self.classes.get(superclass) {
                Some(next) if visited.insert(next.name.as_str()) => current = next,
                _ => return false,
            }
        }
    }
}
