/*!
    model of the bus topology, and the process data layout derived from it.

    A [SlaveNode] tree is built once from the result of a bus scan and the device descriptions found in a [DescriptorStore]. The root node stands for the master port and has station address 0, every other node is a slave owning its children.

    [assign_offsets] then walks the tree depth-first (children in ascending station order) and gives every PDO variable a fixed place in the process image. The layout is immutable: the same topology always gives the same layout.

    ```ignore
        let root = tree::build(&scan, &descriptors)?;
        info!("{}", tree::describe(&root));
        let layout = tree::assign_offsets(&root)?;
    ```
*/

use std::{
    collections::{HashMap, HashSet},
    ops::Range,
    path::Path,
    sync::Arc,
    fmt::Write as _,
    };
use serde::{Deserialize, Serialize};
use log::debug;

use crate::{
    data::DataType,
    error::{EthercatError, EthercatResult},
    };


/// station address reserved to the root node
pub const ROOT_STATION: u16 = 0;


/// one slave as discovered on the bus
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ScannedSlave {
    /// position on the ring, as used by auto-incremented addressing
    pub position: u16,
    /// fixed address to give to the slave (CSA)
    pub station: u16,
    pub vendor: u32,
    pub product: u32,
    /// station of the slave this one is plugged to, `None` or `Some(0)` for the master port
    pub parent: Option<u16>,
    /// the bus cannot operate without this slave
    pub mandatory: bool,
}

/// result of a bus scan: the slaves in ring order
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ScanResult {
    pub slaves: Vec<ScannedSlave>,
}
impl ScanResult {
    pub fn new() -> Self  {Self::default()}
    /// append a mandatory slave at the next ring position
    pub fn with_slave(mut self, station: u16, vendor: u32, product: u32, parent: Option<u16>) -> Self {
        let position = self.slaves.len() as u16;
        self.slaves.push(ScannedSlave {position, station, vendor, product, parent, mandatory: true});
        self
    }
    /// append an optional slave at the next ring position
    pub fn with_optional(mut self, station: u16, vendor: u32, product: u32, parent: Option<u16>) -> Self {
        self = self.with_slave(station, vendor, product, parent);
        if let Some(last) = self.slaves.last_mut() {
            last.mandatory = false;
        }
        self
    }
}


/// direction of process data, seen from the master
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash, Serialize, Deserialize)]
pub enum Direction {
    /// slave to master
    Input,
    /// master to slave
    Output,
}

/// a value inside a [Pdo]
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    #[serde(default)]
    pub data_type: DataType,
    /// bit offset in the owning PDO
    pub bit_offset: usize,
    /// bit length, from 1 to 64
    pub bit_len: usize,
}

/// process data object: a group of variables exchanged together
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Pdo {
    pub name: String,
    /// index of the PDO in the CoE dictionnary
    pub index: u16,
    pub direction: Direction,
    /// declared bit length of the PDO, variables must lie within
    pub bit_len: usize,
    #[serde(default)]
    pub variables: Vec<Variable>,
}

impl Variable {
    pub fn new(name: &str, data_type: DataType, bit_offset: usize, bit_len: usize) -> Self {
        Self {name: name.to_string(), data_type, bit_offset, bit_len}
    }
}
impl Pdo {
    pub fn new(name: &str, index: u16, direction: Direction, bit_len: usize) -> Self {
        Self {name: name.to_string(), index, direction, bit_len, variables: Vec::new()}
    }
    pub fn with_variable(mut self, variable: Variable) -> Self {
        self.variables.push(variable);
        self
    }
    /// check variables are disjoint and within the PDO
    pub fn validate(&self) -> EthercatResult {
        let mut ranges = Vec::with_capacity(self.variables.len());
        for variable in &self.variables {
            if variable.bit_len == 0 || variable.bit_len > 64 {
                return Err(EthercatError::Configuration(format!(
                    "variable {} of pdo {} has invalid bit length {}",
                    variable.name, self.name, variable.bit_len)))
            }
            if variable.data_type.bitsize().map_or(false, |size| variable.bit_len > size) {
                return Err(EthercatError::Configuration(format!(
                    "variable {} of pdo {} has {} bits, more than its type {:?}",
                    variable.name, self.name, variable.bit_len, variable.data_type)))
            }
            if variable.bit_offset + variable.bit_len > self.bit_len {
                return Err(EthercatError::Configuration(format!(
                    "variable {} exceeds pdo {} length ({} > {} bits)",
                    variable.name, self.name, variable.bit_offset + variable.bit_len, self.bit_len)))
            }
            ranges.push((variable.bit_offset .. variable.bit_offset + variable.bit_len, &variable.name));
        }
        ranges.sort_by_key(|(range, _)| range.start);
        for pair in ranges.windows(2) {
            if pair[0].0.end > pair[1].0.start {
                return Err(EthercatError::Configuration(format!(
                    "variables {} and {} overlap in pdo {}",
                    pair[0].1, pair[1].1, self.name)))
            }
        }
        Ok(())
    }
}


/// description of a device model, as found in its ESI file
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescription {
    pub vendor: u32,
    pub product: u32,
    pub name: String,
    #[serde(default)]
    pub pdos: Vec<Pdo>,
}

/// source of device descriptions, keyed by vendor and product identifiers
pub trait DescriptorStore {
    /// PDOs of the given device model, `None` if the model is unknown
    fn pdos(&self, vendor: u32, product: u32) -> Option<Vec<Pdo>>;
    /// human readable name of the given device model
    fn name(&self, _vendor: u32, _product: u32) -> Option<String>  {None}
}

/// in-memory descriptor store
#[derive(Clone, Debug, Default)]
pub struct Descriptors {
    devices: HashMap<(u32, u32), DeviceDescription>,
}

#[derive(Deserialize)]
struct DescriptionFile {
    #[serde(default)]
    device: Vec<DeviceDescription>,
}

impl Descriptors {
    pub fn new() -> Self  {Self::default()}
    pub fn insert(&mut self, device: DeviceDescription) {
        self.devices.insert((device.vendor, device.product), device);
    }
    pub fn with_device(mut self, vendor: u32, product: u32, name: &str, pdos: Vec<Pdo>) -> Self {
        self.insert(DeviceDescription {vendor, product, name: name.to_string(), pdos});
        self
    }
    /**
        parse device descriptions from TOML text, each device is a `[[device]]` table

        ```toml
        [[device]]
        vendor = 2
        product = 0x0c1e3052
        name = "EL3102"

        [[device.pdos]]
        name = "AI Standard Channel 1"
        index = 0x1a00
        direction = "Input"
        bit_len = 32
        variables = [
            {name = "Status__Underrange", data_type = "Bool", bit_offset = 0, bit_len = 1},
            {name = "Value", data_type = "I16", bit_offset = 16, bit_len = 16},
            ]
        ```
    */
    pub fn from_toml(text: &str) -> EthercatResult<Self> {
        let file: DescriptionFile = toml::from_str(text)
            .map_err(|err| EthercatError::Configuration(format!("invalid device description: {}", err)))?;
        let mut new = Self::new();
        for device in file.device {
            new.insert(device);
        }
        Ok(new)
    }
    /// load all the `.toml` device descriptions in a directory
    pub fn load_directory(path: impl AsRef<Path>) -> EthercatResult<Self> {
        let mut new = Self::new();
        let mut files = std::fs::read_dir(path.as_ref())?
            .map(|entry| entry.map(|entry| entry.path()))
            .collect::<Result<Vec<_>, _>>()?;
        files.sort();
        for file in files {
            if file.extension().map_or(true, |ext| ext != "toml")  {continue}
            debug!("loading device descriptions from {}", file.display());
            let loaded = Self::from_toml(&std::fs::read_to_string(&file)?)?;
            new.devices.extend(loaded.devices);
        }
        Ok(new)
    }
    pub fn len(&self) -> usize  {self.devices.len()}
    pub fn is_empty(&self) -> bool  {self.devices.is_empty()}
}
impl DescriptorStore for Descriptors {
    fn pdos(&self, vendor: u32, product: u32) -> Option<Vec<Pdo>> {
        self.devices.get(&(vendor, product)).map(|device| device.pdos.clone())
    }
    fn name(&self, vendor: u32, product: u32) -> Option<String> {
        self.devices.get(&(vendor, product)).map(|device| device.name.clone())
    }
}


/// node of the bus topology, the tree owns its children
#[derive(Clone, Debug, PartialEq)]
pub struct SlaveNode {
    /// fixed address (CSA), 0 for the root
    pub station: u16,
    /// position on the ring
    pub position: u16,
    pub vendor: u32,
    pub product: u32,
    pub name: String,
    pub mandatory: bool,
    /// sorted by ascending station address
    pub children: Vec<SlaveNode>,
    pub pdos: Vec<Pdo>,
}

impl SlaveNode {
    pub fn is_root(&self) -> bool  {self.station == ROOT_STATION}
    /// all the slaves below this node, depth-first, this node excluded
    pub fn slaves(&self) -> Vec<&SlaveNode> {
        let mut found = Vec::new();
        fn walk<'a>(node: &'a SlaveNode, found: &mut Vec<&'a SlaveNode>) {
            for child in &node.children {
                found.push(child);
                walk(child, found);
            }
        }
        walk(self, &mut found);
        found
    }
    /// find the node with the given station address
    pub fn find(&self, station: u16) -> Option<&SlaveNode> {
        if self.station == station  {return Some(self)}
        self.children.iter().find_map(|child| child.find(station))
    }
}

/**
    build the topology tree from a scan

    Fails with [EthercatError::Configuration] on colliding station addresses (0 is reserved to the root), unknown parents, parent relations not leading to the root, devices unknown to the descriptor store, or PDOs whose variables overlap or exceed the PDO length.
*/
pub fn build(scan: &ScanResult, descriptors: &dyn DescriptorStore) -> EthercatResult<SlaveNode> {
    let mut stations = HashSet::new();
    for slave in &scan.slaves {
        if slave.station == ROOT_STATION {
            return Err(EthercatError::Configuration(format!(
                "slave at position {} uses station 0, reserved to the master", slave.position)))
        }
        if ! stations.insert(slave.station) {
            return Err(EthercatError::Configuration(format!(
                "station address {} assigned twice", slave.station)))
        }
    }
    let mut positions = HashSet::new();
    for slave in &scan.slaves {
        if ! positions.insert(slave.position) {
            return Err(EthercatError::Configuration(format!(
                "ring position {} reported twice", slave.position)))
        }
    }

    let mut children = HashMap::<u16, Vec<&ScannedSlave>>::new();
    for slave in &scan.slaves {
        let parent = slave.parent.unwrap_or(ROOT_STATION);
        if parent != ROOT_STATION && ! stations.contains(&parent) {
            return Err(EthercatError::Configuration(format!(
                "slave {} has unknown parent {}", slave.station, parent)))
        }
        children.entry(parent).or_default().push(slave);
    }
    for list in children.values_mut() {
        list.sort_by_key(|slave| slave.station);
    }

    fn attach(
        station: u16,
        children: &HashMap<u16, Vec<&ScannedSlave>>,
        descriptors: &dyn DescriptorStore,
        count: &mut usize,
    ) -> EthercatResult<Vec<SlaveNode>> {
        let mut nodes = Vec::new();
        for slave in children.get(&station).map(Vec::as_slice).unwrap_or_default() {
            *count += 1;
            let pdos = descriptors.pdos(slave.vendor, slave.product)
                .ok_or_else(|| EthercatError::Configuration(format!(
                    "no description for slave {} (vendor 0x{:x}, product 0x{:x})",
                    slave.station, slave.vendor, slave.product)))?;
            for pdo in &pdos {
                pdo.validate()?;
            }
            nodes.push(SlaveNode {
                station: slave.station,
                position: slave.position,
                vendor: slave.vendor,
                product: slave.product,
                name: descriptors.name(slave.vendor, slave.product)
                    .unwrap_or_else(|| format!("slave {}", slave.station)),
                mandatory: slave.mandatory,
                children: attach(slave.station, children, descriptors, count)?,
                pdos,
            });
        }
        Ok(nodes)
    }

    let mut count = 0;
    let root = SlaveNode {
        station: ROOT_STATION,
        position: 0,
        vendor: 0,
        product: 0,
        name: String::from("master"),
        mandatory: true,
        children: attach(ROOT_STATION, &children, descriptors, &mut count)?,
        pdos: Vec::new(),
    };
    if count != scan.slaves.len() {
        return Err(EthercatError::Configuration(format!(
            "{} slaves are not connected to the master (cyclic parent relation)",
            scan.slaves.len() - count)))
    }
    Ok(root)
}

/// slave listing report: name, station, PDO count and PDO names of each slave
pub fn describe(root: &SlaveNode) -> String {
    let slaves = root.slaves();
    let mut report = format!("{} slaves on the bus", slaves.len());
    for slave in slaves {
        let _ = write!(report,
            "\n  [{}] {} (station {}, vendor 0x{:x}, product 0x{:x}{}), {} pdos",
            slave.position, slave.name, slave.station, slave.vendor, slave.product,
            if slave.mandatory {""} else {", optional"},
            slave.pdos.len(),
            );
        for pdo in &slave.pdos {
            let _ = write!(report, "\n    0x{:04x} {} ({:?}, {} bits)", pdo.index, pdo.name, pdo.direction, pdo.bit_len);
        }
    }
    report
}


/// place of one variable in the process image
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VariableInfo {
    pub station: u16,
    /// name of the owning PDO
    pub pdo: String,
    /// index of the owning PDO
    pub pdo_index: u16,
    pub name: String,
    pub data_type: DataType,
    pub direction: Direction,
    /// byte offset in the direction's buffer
    pub byte: usize,
    /// bit offset in [Self::byte], from 0 to 7
    pub bit: u8,
    pub bit_len: usize,
}
impl VariableInfo {
    /// bit offset in the direction's buffer
    pub fn bit_offset(&self) -> usize  {self.byte * 8 + usize::from(self.bit)}
}

/// bit ranges of a slave's PDOs in the image buffers
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SlaveMapping {
    pub station: u16,
    /// bit range in the output buffer, `None` if the slave has no output PDO
    pub outputs: Option<Range<usize>>,
    /// bit range in the input buffer, `None` if the slave has no input PDO
    pub inputs: Option<Range<usize>>,
}

/**
    immutable placement of all variables in the process image

    Outputs occupy the logical memory from address 0, inputs follow in the next byte after the outputs.
*/
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProcessLayout {
    variables: Vec<VariableInfo>,
    slaves: Vec<SlaveMapping>,
    outputs: usize,
    inputs: usize,
}

impl ProcessLayout {
    pub fn variables(&self) -> &[VariableInfo]  {&self.variables}
    pub fn variable(&self, index: usize) -> Option<&VariableInfo>  {self.variables.get(index)}
    /// index of the variable with the given name in the given slave
    pub fn lookup(&self, station: u16, name: &str) -> Option<usize> {
        self.variables.iter().position(|variable| variable.station == station && variable.name == name)
    }
    /// per slave bit ranges, in walk order
    pub fn slaves(&self) -> &[SlaveMapping]  {&self.slaves}
    pub fn slave(&self, station: u16) -> Option<&SlaveMapping> {
        self.slaves.iter().find(|slave| slave.station == station)
    }
    /// byte size of the buffer of the given direction
    pub fn size(&self, direction: Direction) -> usize {
        match direction {
            Direction::Output => self.outputs,
            Direction::Input => self.inputs,
        }
    }
    /// byte address in the logical memory of the given direction's buffer
    pub fn logical(&self, direction: Direction) -> usize {
        match direction {
            Direction::Output => 0,
            Direction::Input => self.outputs,
        }
    }
    /// byte size of the logical memory used
    pub fn frame_size(&self) -> usize  {self.outputs + self.inputs}
}

/**
    assign every variable of the tree its place in the process image

    PDOs of one direction are packed bit-contiguously in walk order, so each slave gets one contiguous bit range per direction.
*/
pub fn assign_offsets(root: &SlaveNode) -> EthercatResult<Arc<ProcessLayout>> {
    let mut variables = Vec::new();
    let mut slaves = Vec::new();
    let mut outputs = 0;
    let mut inputs = 0;

    for slave in root.slaves() {
        let mut mapping = SlaveMapping {station: slave.station, outputs: None, inputs: None};
        for pdo in &slave.pdos {
            let (cursor, range) = match pdo.direction {
                Direction::Output => (&mut outputs, &mut mapping.outputs),
                Direction::Input => (&mut inputs, &mut mapping.inputs),
            };
            let start = *cursor;
            for variable in &pdo.variables {
                let bit = start + variable.bit_offset;
                variables.push(VariableInfo {
                    station: slave.station,
                    pdo: pdo.name.clone(),
                    pdo_index: pdo.index,
                    name: variable.name.clone(),
                    data_type: variable.data_type,
                    direction: pdo.direction,
                    byte: bit / 8,
                    bit: (bit % 8) as u8,
                    bit_len: variable.bit_len,
                });
            }
            *cursor += pdo.bit_len;
            let end = *cursor;
            *range = Some(range.as_ref().map_or(start, |range| range.start) .. end);
        }
        slaves.push(mapping);
    }
    check_overlaps(&variables)?;

    let layout = ProcessLayout {
        variables,
        slaves,
        outputs: (outputs + 7) / 8,
        inputs: (inputs + 7) / 8,
    };
    debug!("process image layout: {} variables, {} output bytes, {} input bytes",
        layout.variables.len(), layout.outputs, layout.inputs);
    Ok(Arc::new(layout))
}

fn check_overlaps(variables: &[VariableInfo]) -> EthercatResult {
    for direction in [Direction::Output, Direction::Input] {
        let mut ranges = variables.iter()
            .filter(|variable| variable.direction == direction)
            .map(|variable| (variable.bit_offset() .. variable.bit_offset() + variable.bit_len, variable))
            .collect::<Vec<_>>();
        ranges.sort_by_key(|(range, _)| range.start);
        for pair in ranges.windows(2) {
            if pair[0].0.end > pair[1].0.start {
                return Err(EthercatError::Configuration(format!(
                    "variables {}.{} and {}.{} overlap in the process image",
                    pair[0].1.station, pair[0].1.name, pair[1].1.station, pair[1].1.name)))
            }
        }
    }
    Ok(())
}


#[cfg(test)]
mod tests {
    use super::*;

    fn analog() -> Vec<Pdo> {
        vec![
            Pdo::new("AI Standard Channel 1", 0x1a00, Direction::Input, 32)
                .with_variable(Variable::new("Status__Underrange", DataType::Bool, 0, 1))
                .with_variable(Variable::new("Status__Overrange", DataType::Bool, 1, 1))
                .with_variable(Variable::new("Value", DataType::I16, 16, 16)),
            ]
    }
    fn digital() -> Vec<Pdo> {
        vec![
            Pdo::new("Channel 1", 0x1600, Direction::Output, 1)
                .with_variable(Variable::new("Output", DataType::Bool, 0, 1)),
            Pdo::new("Channel 2", 0x1601, Direction::Output, 1)
                .with_variable(Variable::new("Output", DataType::Bool, 0, 1)),
            ]
    }
    fn store() -> Descriptors {
        Descriptors::new()
            .with_device(2, 0x0c1e3052, "EL3102", analog())
            .with_device(2, 0x07d83052, "EL2002", digital())
    }

    #[test]
    fn hierarchy() {
        let scan = ScanResult::new()
            .with_slave(1002, 2, 0x07d83052, Some(1001))
            .with_slave(1001, 2, 0x0c1e3052, None)
            .with_optional(1003, 2, 0x07d83052, Some(1001));
        let root = build(&scan, &store()).unwrap();
        assert!(root.is_root());
        assert_eq!(root.children.len(), 1);
        let stations = root.slaves().iter().map(|slave| slave.station).collect::<Vec<_>>();
        assert_eq!(stations, [1001, 1002, 1003]);
        assert_eq!(root.find(1002).unwrap().name, "EL2002");
        assert!(! root.find(1003).unwrap().mandatory);
        assert!(describe(&root).contains("EL3102"));
    }

    #[test]
    fn rejected_topologies() {
        let store = store();
        // station collision
        assert!(build(&ScanResult::new()
            .with_slave(1, 2, 0x07d83052, None)
            .with_slave(1, 2, 0x07d83052, None), &store).is_err());
        // station 0 is the root
        assert!(build(&ScanResult::new().with_slave(0, 2, 0x07d83052, None), &store).is_err());
        // unknown parent
        assert!(build(&ScanResult::new().with_slave(1, 2, 0x07d83052, Some(7)), &store).is_err());
        // parents not reaching the root
        assert!(build(&ScanResult::new()
            .with_slave(1, 2, 0x07d83052, Some(2))
            .with_slave(2, 2, 0x07d83052, Some(1)), &store).is_err());
        // unknown device
        assert!(build(&ScanResult::new().with_slave(1, 9, 9, None), &store).is_err());
    }

    #[test]
    fn overlapping_variables() {
        let store = Descriptors::new().with_device(1, 1, "broken", vec![
            Pdo::new("status", 0x1a00, Direction::Input, 16)
                .with_variable(Variable::new("a", DataType::U8, 0, 8))
                .with_variable(Variable::new("b", DataType::U8, 4, 8)),
            ]);
        let error = build(&ScanResult::new().with_slave(1, 1, 1, None), &store).unwrap_err();
        assert!(matches!(error, EthercatError::Configuration(_)));

        let store = Descriptors::new().with_device(1, 1, "broken", vec![
            Pdo::new("status", 0x1a00, Direction::Input, 8)
                .with_variable(Variable::new("a", DataType::U16, 0, 16)),
            ]);
        assert!(build(&ScanResult::new().with_slave(1, 1, 1, None), &store).is_err());

        // wider than its data type
        let store = Descriptors::new().with_device(1, 1, "broken", vec![
            Pdo::new("status", 0x1a00, Direction::Input, 16)
                .with_variable(Variable::new("flag", DataType::Bool, 0, 2)),
            ]);
        assert!(matches!(
            build(&ScanResult::new().with_slave(1, 1, 1, None), &store),
            Err(EthercatError::Configuration(_)),
            ));
        // paddings have no fixed size
        let store = Descriptors::new().with_device(1, 1, "padded", vec![
            Pdo::new("status", 0x1a00, Direction::Input, 16)
                .with_variable(Variable::new("gap", DataType::Void, 0, 12))
                .with_variable(Variable::new("flag", DataType::Bool, 12, 1)),
            ]);
        assert!(build(&ScanResult::new().with_slave(1, 1, 1, None), &store).is_ok());
    }

    #[test]
    fn offsets() {
        let scan = ScanResult::new()
            .with_slave(1, 2, 0x0c1e3052, None)
            .with_slave(2, 2, 0x07d83052, None)
            .with_slave(3, 2, 0x07d83052, None);
        let layout = assign_offsets(&build(&scan, &store()).unwrap()).unwrap();

        assert_eq!(layout.size(Direction::Input), 4);
        // 4 output bits rounded to one byte
        assert_eq!(layout.size(Direction::Output), 1);
        assert_eq!(layout.logical(Direction::Input), 1);

        let value = layout.variable(layout.lookup(1, "Value").unwrap()).unwrap();
        assert_eq!((value.byte, value.bit, value.bit_len), (2, 0, 16));
        let second = layout.variables().iter()
            .filter(|variable| variable.station == 3)
            .map(|variable| variable.bit_offset())
            .collect::<Vec<_>>();
        assert_eq!(second, [2, 3]);
        assert_eq!(layout.slave(2).unwrap().outputs, Some(0 .. 2));
        assert_eq!(layout.slave(2).unwrap().inputs, None);

        // identical topologies give identical layouts
        let again = assign_offsets(&build(&scan, &store()).unwrap()).unwrap();
        assert_eq!(*layout, *again);
    }

    #[test]
    fn descriptions_from_toml() {
        let store = Descriptors::from_toml(r#"
            [[device]]
            vendor = 2
            product = 0x0c1e3052
            name = "EL3102"

            [[device.pdos]]
            name = "AI Standard Channel 1"
            index = 0x1a00
            direction = "Input"
            bit_len = 32
            variables = [
                {name = "Status__Underrange", data_type = "Bool", bit_offset = 0, bit_len = 1},
                {name = "Value", data_type = "I16", bit_offset = 16, bit_len = 16},
                ]
            "#).unwrap();
        assert_eq!(store.len(), 1);
        assert_eq!(store.name(2, 0x0c1e3052).as_deref(), Some("EL3102"));
        assert_eq!(store.pdos(2, 0x0c1e3052).unwrap()[0].variables[1].data_type, DataType::I16);
        assert!(store.pdos(2, 0).is_none());
    }

    #[test]
    fn descriptions_from_directory() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("el1008.toml"), r#"
            [[device]]
            vendor = 2
            product = 0x03f03052
            name = "EL1008"
            "#).unwrap();
        std::fs::write(dir.path().join("el2008.toml"), r#"
            [[device]]
            vendor = 2
            product = 0x07d83052
            name = "EL2008"

            [[device.pdos]]
            name = "Channel 1"
            index = 0x1600
            direction = "Output"
            bit_len = 1
            variables = [{name = "Output", data_type = "Bool", bit_offset = 0, bit_len = 1}]
            "#).unwrap();
        // other files are ignored
        std::fs::write(dir.path().join("README"), "not a description").unwrap();

        let store = Descriptors::load_directory(dir.path()).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.name(2, 0x03f03052).as_deref(), Some("EL1008"));
        assert_eq!(store.pdos(2, 0x07d83052).unwrap()[0].direction, Direction::Output);

        std::fs::write(dir.path().join("broken.toml"), "[[device]]\nvendor = \"two\"").unwrap();
        assert!(matches!(Descriptors::load_directory(dir.path()), Err(EthercatError::Configuration(_))));
        assert!(Descriptors::load_directory(dir.path().join("missing")).is_err());
    }
}
